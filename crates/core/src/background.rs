//! Completion handlers for transfers finished outside the process.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

type CompletionHandler = Box<dyn FnOnce() + Send>;

/// Stores host-provided completion handlers per background session identifier.
///
/// The host registers a handler when it relaunches the process to deliver
/// background transfer events, and the handler runs once those events have
/// been processed.
#[derive(Default)]
pub struct BackgroundCompletions {
	handlers: Mutex<HashMap<String, CompletionHandler>>,
}

impl BackgroundCompletions {
	pub fn new() -> Self {
		Self::default()
	}

	/// Stores `handler` for `identifier`; returns `true` if it replaced an earlier one.
	pub fn register(&self, identifier: impl Into<String>, handler: impl FnOnce() + Send + 'static) -> bool {
		let identifier = identifier.into();
		debug!(target = "courier.session", %identifier, "background completion handler registered");
		let replaced = self.handlers.lock().insert(identifier.clone(), Box::new(handler)).is_some();
		if replaced {
			warn!(target = "courier.session", %identifier, "replaced pending background completion handler");
		}
		replaced
	}

	/// Runs and removes the handler for `identifier`.
	pub fn finish(&self, identifier: &str) -> bool {
		let handler = self.handlers.lock().remove(identifier);
		match handler {
			Some(handler) => {
				handler();
				true
			}
			None => false,
		}
	}

	/// Identifiers with a handler still waiting.
	pub fn pending(&self) -> Vec<String> {
		let mut identifiers: Vec<String> = self.handlers.lock().keys().cloned().collect();
		identifiers.sort();
		identifiers
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn handler_runs_once() {
		let completions = BackgroundCompletions::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&calls);
		assert!(!completions.register("bg-1", move || {
			counter.fetch_add(1, Ordering::SeqCst);
		}));

		assert!(completions.finish("bg-1"));
		assert!(!completions.finish("bg-1"));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn registering_twice_replaces() {
		let completions = BackgroundCompletions::new();
		assert!(!completions.register("bg", || {}));
		assert!(completions.register("bg", || {}));
		assert_eq!(completions.pending(), vec!["bg".to_string()]);
	}
}
