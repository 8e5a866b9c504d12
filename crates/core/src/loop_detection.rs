//! Detection of requests sent over and over in a short time.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use courier_protocol::Method;

use crate::config::LoopDetectionConfig;

/// Counts dispatches per method and path inside a sliding window.
#[derive(Debug)]
pub struct RequestLoopDetector {
	threshold: usize,
	window: Duration,
	seen: HashMap<(Method, String), VecDeque<Instant>>,
	reported: HashMap<(Method, String), Instant>,
}

impl RequestLoopDetector {
	pub fn new(config: LoopDetectionConfig) -> Self {
		Self {
			threshold: config.threshold.max(1),
			window: Duration::from_secs(config.window_secs),
			seen: HashMap::new(),
			reported: HashMap::new(),
		}
	}

	/// Records a dispatch and returns `true` when it crosses the threshold.
	///
	/// A given request is reported at most once per window.
	pub fn record(&mut self, method: Method, path: &str, now: Instant) -> bool {
		let window = self.window;
		self.seen.retain(|_, hits| {
			while hits.front().is_some_and(|hit| now.duration_since(*hit) > window) {
				let _ = hits.pop_front();
			}
			!hits.is_empty()
		});
		self.reported.retain(|_, at| now.duration_since(*at) <= window);

		let key = (method, path.to_string());
		let hits = self.seen.entry(key.clone()).or_default();
		hits.push_back(now);
		if hits.len() <= self.threshold || self.reported.contains_key(&key) {
			return false;
		}
		let _ = self.reported.insert(key, now);
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn detector(threshold: usize) -> RequestLoopDetector {
		RequestLoopDetector::new(LoopDetectionConfig { threshold, window_secs: 10 })
	}

	#[test]
	fn reports_once_threshold_is_exceeded() {
		let mut detector = detector(3);
		let now = Instant::now();
		for _ in 0..3 {
			assert!(!detector.record(Method::Get, "/notifications", now));
		}
		assert!(detector.record(Method::Get, "/notifications", now));
		assert!(!detector.record(Method::Get, "/notifications", now));
	}

	#[test]
	fn distinct_paths_are_counted_separately() {
		let mut detector = detector(1);
		let now = Instant::now();
		assert!(!detector.record(Method::Get, "/a", now));
		assert!(!detector.record(Method::Get, "/b", now));
		assert!(!detector.record(Method::Post, "/a", now));
		assert!(detector.record(Method::Get, "/a", now));
	}

	#[test]
	fn hits_outside_the_window_are_forgotten() {
		let mut detector = detector(1);
		let start = Instant::now();
		assert!(!detector.record(Method::Get, "/a", start));
		let later = start + Duration::from_secs(11);
		assert!(!detector.record(Method::Get, "/a", later));
		assert!(detector.record(Method::Get, "/a", later));
	}
}
