//! Transport responses as seen by the scheduler.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Status codes the server uses to ask clients to hold off.
pub const BACKOFF_STATUSES: [u16; 3] = [420, 429, 503];

/// Raw response returned by a transport.
///
/// The body is opaque to the session; only the status class is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
	pub status: u16,
	#[serde(default)]
	pub body: Vec<u8>,
}

impl HttpResponse {
	pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
		Self { status, body: body.into() }
	}

	/// Response with a JSON-encoded body.
	pub fn json_body(status: u16, value: &serde_json::Value) -> Self {
		Self::new(status, value.to_string())
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}

	/// The server rejected the credential the request carried.
	pub fn is_unauthorized(&self) -> bool {
		self.status == 401
	}

	/// The server asked the client to back off.
	pub fn is_backoff(&self) -> bool {
		BACKOFF_STATUSES.contains(&self.status)
	}

	/// Decodes the body as JSON.
	pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
		serde_json::from_slice(&self.body)
	}

	/// Body as UTF-8 text, replacing invalid sequences.
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_status_codes() {
		assert!(HttpResponse::new(204, Vec::new()).is_success());
		assert!(HttpResponse::new(401, Vec::new()).is_unauthorized());
		assert!(!HttpResponse::new(403, Vec::new()).is_unauthorized());
		for status in BACKOFF_STATUSES {
			assert!(HttpResponse::new(status, Vec::new()).is_backoff());
		}
		assert!(!HttpResponse::new(500, Vec::new()).is_backoff());
	}

	#[test]
	fn decodes_json_body() {
		let response = HttpResponse::json_body(200, &serde_json::json!({"id": 7}));
		let value: serde_json::Value = response.json().unwrap();
		assert_eq!(value["id"], 7);
		assert_eq!(response.text(), r#"{"id":7}"#);
	}
}
