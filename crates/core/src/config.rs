//! Session tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

/// Default number of concurrently dispatched requests.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Tunables for a [`Session`](crate::Session).
///
/// Every field has a default, so a partial JSON object deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
	/// Concurrency budget for ordinary requests.
	pub max_concurrent: usize,
	pub loop_detection: LoopDetectionConfig,
	/// Hold-off applied after the server answers 420/429/503.
	pub server_backoff: BackoffConfig,
	/// Delay between push channel reconnect attempts after transport errors.
	pub push_reconnect: BackoffConfig,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			max_concurrent: DEFAULT_MAX_CONCURRENT,
			loop_detection: LoopDetectionConfig::default(),
			server_backoff: BackoffConfig {
				base_ms: 1_000,
				max_ms: 60_000,
			},
			push_reconnect: BackoffConfig { base_ms: 500, max_ms: 30_000 },
		}
	}
}

/// Exponential backoff bounds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
	pub base_ms: u64,
	pub max_ms: u64,
}

impl BackoffConfig {
	pub fn backoff(&self) -> Backoff {
		Backoff::new(Duration::from_millis(self.base_ms), Duration::from_millis(self.max_ms.max(self.base_ms)))
	}
}

/// Thresholds for flagging a request that is being sent over and over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
	/// Dispatches of the same method and path tolerated inside one window.
	pub threshold: usize,
	pub window_secs: u64,
}

impl Default for LoopDetectionConfig {
	fn default() -> Self {
		Self {
			threshold: 20,
			window_secs: 60,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_config_fills_defaults() {
		let config: SessionConfig = serde_json::from_str(r#"{"max_concurrent": 2}"#).unwrap();
		assert_eq!(config.max_concurrent, 2);
		assert_eq!(config.loop_detection, LoopDetectionConfig::default());
		assert_eq!(config.server_backoff.base_ms, 1_000);
	}
}
