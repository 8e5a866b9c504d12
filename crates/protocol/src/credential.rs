//! Access credential attached to authenticated requests.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds before the stated expiry at which a credential is already treated as expired.
pub const EXPIRY_LEEWAY_SECS: u64 = 15;

const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Opaque access token plus its type and expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
	/// Token value sent to the server.
	pub token: String,
	/// Authorization scheme, usually `Bearer`.
	#[serde(default = "default_token_type")]
	pub token_type: String,
	/// Expiry as unix seconds; `None` means the server decides.
	#[serde(default)]
	pub expires_at: Option<u64>,
}

fn default_token_type() -> String {
	DEFAULT_TOKEN_TYPE.to_string()
}

impl Credential {
	/// Creates a bearer credential without a known expiry.
	pub fn bearer(token: impl Into<String>) -> Self {
		Self {
			token: token.into(),
			token_type: default_token_type(),
			expires_at: None,
		}
	}

	/// Sets the expiry to `secs` seconds from now.
	pub fn expiring_in(mut self, secs: u64) -> Self {
		self.expires_at = Some(now_ts().saturating_add(secs));
		self
	}

	/// Sets an absolute expiry in unix seconds.
	pub fn with_expires_at(mut self, expires_at: u64) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	/// Returns `true` when the credential is still usable at `now` (unix seconds).
	pub fn is_valid_at(&self, now: u64) -> bool {
		if self.token.is_empty() {
			return false;
		}
		match self.expires_at {
			Some(expires_at) => now.saturating_add(EXPIRY_LEEWAY_SECS) < expires_at,
			None => true,
		}
	}

	/// Returns `true` when the credential is usable right now.
	pub fn is_valid(&self) -> bool {
		self.is_valid_at(now_ts())
	}

	/// Value for the `Authorization` header.
	pub fn authorization(&self) -> String {
		format!("{} {}", self.token_type, self.token)
	}
}

impl fmt::Debug for Credential {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credential")
			.field("token", &"<redacted>")
			.field("token_type", &self.token_type)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Current wall-clock time in unix seconds.
pub fn now_ts() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn credential_without_expiry_is_valid() {
		assert!(Credential::bearer("abc").is_valid());
	}

	#[test]
	fn empty_token_is_never_valid() {
		assert!(!Credential::bearer("").is_valid());
	}

	#[test]
	fn expiry_applies_leeway() {
		let credential = Credential::bearer("abc").with_expires_at(1_000);
		assert!(credential.is_valid_at(1_000 - EXPIRY_LEEWAY_SECS - 1));
		assert!(!credential.is_valid_at(1_000 - EXPIRY_LEEWAY_SECS));
		assert!(!credential.is_valid_at(2_000));
	}

	#[test]
	fn debug_output_hides_token() {
		let rendered = format!("{:?}", Credential::bearer("secret-token"));
		assert!(!rendered.contains("secret-token"));
		assert!(rendered.contains("Bearer"));
	}

	#[test]
	fn deserializes_with_default_token_type() {
		let credential: Credential = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
		assert_eq!(credential.token_type, "Bearer");
		assert_eq!(credential.authorization(), "Bearer abc");
		assert_eq!(credential.expires_at, None);
	}
}
