//! Descriptors for transfers running on the background transport.

use serde::{Deserialize, Serialize};

use crate::types::Method;

/// A transfer tracked by the background transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundTask {
	/// Transport-assigned task identifier.
	pub task_id: u64,
	/// Request identifier assigned by the session.
	pub request_id: u64,
	pub method: Method,
	pub path: String,
	/// Start time in unix seconds.
	pub started_at: u64,
}
