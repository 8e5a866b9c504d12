//! Session-level enums and small value types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed availability of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityState {
	#[default]
	Unknown,
	Reachable,
	Unreachable,
}

impl ReachabilityState {
	/// Admission is refused only for an explicit `Unreachable`; `Unknown` is optimistic.
	pub fn allows_dispatch(self) -> bool {
		!matches!(self, Self::Unreachable)
	}
}

/// Lifecycle of the push channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PushChannelState {
	#[default]
	Closed,
	Opening,
	Open,
	Closing,
}

/// Priority class of a request; higher classes are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Low,
	#[default]
	Normal,
	High,
}

impl Priority {
	/// All classes from highest to lowest.
	pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

	/// Dense index used by per-class queues.
	pub fn index(self) -> usize {
		match self {
			Self::Low => 0,
			Self::Normal => 1,
			Self::High => 2,
		}
	}
}

/// Which transport session a request travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyGroup {
	#[default]
	Foreground,
	Background,
}

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
	Get,
	Post,
	Put,
	Patch,
	Delete,
	Head,
}

impl Method {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Get => "GET",
			Self::Post => "POST",
			Self::Put => "PUT",
			Self::Patch => "PATCH",
			Self::Delete => "DELETE",
			Self::Head => "HEAD",
		}
	}
}

impl fmt::Display for Method {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for Method {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"GET" => Ok(Self::Get),
			"POST" => Ok(Self::Post),
			"PUT" => Ok(Self::Put),
			"PATCH" => Ok(Self::Patch),
			"DELETE" => Ok(Self::Delete),
			"HEAD" => Ok(Self::Head),
			other => Err(format!("unsupported method: {other}")),
		}
	}
}

/// Result of a flow-controlled enqueue attempt.
///
/// Callers keep generating work while `had_capacity_before_this_call` is `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnqueueResult {
	pub had_capacity_before_this_call: bool,
	pub did_produce_request: bool,
}

impl EnqueueResult {
	pub const fn new(had_capacity_before_this_call: bool, did_produce_request: bool) -> Self {
		Self {
			had_capacity_before_this_call,
			did_produce_request,
		}
	}

	/// No slot was free (or admission was refused); the generator was not called.
	pub const fn no_capacity() -> Self {
		Self::new(false, false)
	}
}

/// Error domain surfaced on failed request outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorCode {
	/// Programmer error; should not occur.
	Invalid,
	/// The credential could not be obtained or renewed.
	AuthenticationFailed,
	/// The request deadline passed before dispatch.
	RequestExpired,
	/// Reachability or server backoff prevented dispatch; the caller may re-enqueue.
	TryAgainLater,
}

impl fmt::Display for SessionErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Invalid => "invalid",
			Self::AuthenticationFailed => "authentication failed",
			Self::RequestExpired => "request expired",
			Self::TryAgainLater => "try again later",
		};
		f.write_str(name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn priorities_order_high_above_low() {
		assert!(Priority::High > Priority::Normal);
		assert!(Priority::Normal > Priority::Low);
		assert_eq!(Priority::DESCENDING[0], Priority::High);
	}

	#[test]
	fn unknown_reachability_allows_dispatch() {
		assert!(ReachabilityState::Unknown.allows_dispatch());
		assert!(ReachabilityState::Reachable.allows_dispatch());
		assert!(!ReachabilityState::Unreachable.allows_dispatch());
	}

	#[test]
	fn method_parses_case_insensitively() {
		assert_eq!("get".parse::<Method>(), Ok(Method::Get));
		assert_eq!("DELETE".parse::<Method>(), Ok(Method::Delete));
		assert!("TRACE".parse::<Method>().is_err());
	}

	#[test]
	fn error_codes_serialize_snake_case() {
		let json = serde_json::to_string(&SessionErrorCode::TryAgainLater).unwrap();
		assert_eq!(json, "\"try_again_later\"");
	}
}
