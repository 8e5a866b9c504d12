//! Error types for the transport session.

use courier_protocol::SessionErrorCode;
use thiserror::Error;

/// Result alias used across the session.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure outcome of a request or a session operation.
#[derive(Debug, Error)]
pub enum Error {
	/// Programmer error: an operation was used outside its contract.
	#[error("invalid use of session: {0}")]
	Invalid(String),

	/// No credential could be obtained or renewed.
	#[error("authentication failed")]
	AuthenticationFailed,

	/// The request deadline passed before it could be dispatched.
	#[error("request expired before dispatch")]
	RequestExpired,

	/// Reachability or server backoff prevented dispatch.
	#[error("try again later")]
	TryAgainLater,

	/// The request was cancelled by the caller.
	#[error("request cancelled")]
	Cancelled,

	/// The transport failed below HTTP.
	#[error("network error: {0}")]
	Network(String),

	/// A renewer or push handshake was rejected by the server.
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	/// No Tokio runtime was available to drive the session.
	#[error("no tokio runtime available: {0}")]
	Runtime(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Maps to the session error domain, when the error belongs to it.
	pub fn code(&self) -> Option<SessionErrorCode> {
		match self {
			Self::Invalid(_) => Some(SessionErrorCode::Invalid),
			Self::AuthenticationFailed => Some(SessionErrorCode::AuthenticationFailed),
			Self::RequestExpired => Some(SessionErrorCode::RequestExpired),
			Self::TryAgainLater => Some(SessionErrorCode::TryAgainLater),
			_ => None,
		}
	}

	/// Rebuilds an error from its domain code.
	pub fn from_code(code: SessionErrorCode) -> Self {
		match code {
			SessionErrorCode::Invalid => Self::Invalid("unspecified".to_string()),
			SessionErrorCode::AuthenticationFailed => Self::AuthenticationFailed,
			SessionErrorCode::RequestExpired => Self::RequestExpired,
			SessionErrorCode::TryAgainLater => Self::TryAgainLater,
		}
	}

	/// Returns `true` for outcomes the caller is expected to re-enqueue.
	pub fn is_try_again_later(&self) -> bool {
		matches!(self, Self::TryAgainLater)
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn domain_errors_round_trip_through_codes() {
		for code in [
			SessionErrorCode::AuthenticationFailed,
			SessionErrorCode::RequestExpired,
			SessionErrorCode::TryAgainLater,
		] {
			assert_eq!(Error::from_code(code).code(), Some(code));
		}
	}

	#[test]
	fn transport_errors_have_no_domain_code() {
		assert_eq!(Error::Network("reset".into()).code(), None);
		assert_eq!(Error::Cancelled.code(), None);
	}
}
