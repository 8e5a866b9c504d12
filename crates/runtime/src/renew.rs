//! Credential renewal against an `/access` endpoint using a login cookie.

use std::time::Duration;

use courier::{CredentialRenewer, Error, Result};
use courier_protocol::Credential;
use futures_util::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http::{build_client, parse_base};

const ACCESS_PATH: &str = "access";
const RENEW_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct AccessResponse {
	access_token: String,
	#[serde(default)]
	token_type: Option<String>,
	#[serde(default)]
	expires_in: Option<u64>,
}

impl AccessResponse {
	fn into_credential(self) -> Credential {
		let mut credential = Credential::bearer(self.access_token);
		if let Some(token_type) = self.token_type.filter(|t| !t.is_empty()) {
			credential.token_type = token_type;
		}
		match self.expires_in {
			Some(secs) => credential.expiring_in(secs),
			None => credential,
		}
	}
}

/// Trades a long-lived login cookie for a fresh access credential.
pub struct CookieRenewer {
	endpoint: Url,
	cookie: String,
	client: Client,
}

impl CookieRenewer {
	pub fn new(base_url: &str, cookie: impl Into<String>) -> Result<Self> {
		let endpoint = parse_base(base_url)?
			.join(ACCESS_PATH)
			.map_err(|err| Error::Invalid(format!("bad base URL {base_url:?}: {err}")))?;
		Ok(Self {
			endpoint,
			cookie: cookie.into(),
			client: build_client(RENEW_TIMEOUT)?,
		})
	}

	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	async fn request(&self, previous: Option<&Credential>) -> Result<Credential> {
		let mut builder = self.client.post(self.endpoint.clone()).header(COOKIE, self.cookie.as_str());
		if let Some(previous) = previous {
			builder = builder.header(AUTHORIZATION, previous.authorization());
		}

		let response = builder
			.send()
			.await
			.map_err(|err| Error::Network(format!("access request failed: {err}")))?;
		let status = response.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			warn!(target = "courier.credential", status = status.as_u16(), "login cookie rejected");
			return Err(Error::AuthenticationFailed);
		}
		if !status.is_success() {
			return Err(Error::Network(format!("access request returned {status}")));
		}

		let body: AccessResponse = response
			.json()
			.await
			.map_err(|err| Error::Network(format!("malformed access response: {err}")))?;
		debug!(target = "courier.credential", expires_in = ?body.expires_in, "access credential issued");
		Ok(body.into_credential())
	}
}

impl CredentialRenewer for CookieRenewer {
	fn renew<'a>(&'a self, previous: Option<&'a Credential>) -> BoxFuture<'a, Result<Credential>> {
		Box::pin(self.request(previous))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoint_sits_under_the_base_path() {
		let renewer = CookieRenewer::new("https://example.test/api", "zuid=abc").unwrap();
		assert_eq!(renewer.endpoint().as_str(), "https://example.test/api/access");
	}

	#[test]
	fn access_response_defaults_to_bearer() {
		let body: AccessResponse = serde_json::from_str(r#"{"access_token":"t1","expires_in":900}"#).unwrap();
		let credential = body.into_credential();
		assert_eq!(credential.token_type, "Bearer");
		assert!(credential.is_valid());
		assert!(credential.expires_at.is_some());
	}
}
