//! Frames carried by the push channel.

use serde::{Deserialize, Serialize};

/// A single push channel message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum PushFrame {
	/// Structured event, sent as a text frame.
	Json(serde_json::Value),
	/// Opaque payload, sent as a binary frame.
	Binary(Vec<u8>),
}

impl PushFrame {
	/// Parses a text frame; non-JSON text is kept as its raw bytes.
	pub fn from_text(text: &str) -> Self {
		match serde_json::from_str(text) {
			Ok(value) => Self::Json(value),
			Err(_) => Self::Binary(text.as_bytes().to_vec()),
		}
	}

	pub fn as_json(&self) -> Option<&serde_json::Value> {
		match self {
			Self::Json(value) => Some(value),
			Self::Binary(_) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn text_frames_parse_as_json_when_possible() {
		let frame = PushFrame::from_text(r#"{"type":"event"}"#);
		assert_eq!(frame.as_json().unwrap()["type"], "event");

		let frame = PushFrame::from_text("not json");
		assert_eq!(frame, PushFrame::Binary(b"not json".to_vec()));
	}
}
