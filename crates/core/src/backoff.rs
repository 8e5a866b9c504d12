//! Exponential backoff for server hold-offs and push reconnects.

use std::time::Duration;

const FACTOR: u32 = 2;

/// Doubling delay capped at a maximum, reset after a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
	base: Duration,
	max: Duration,
	attempt: u32,
}

impl Backoff {
	pub const fn new(base: Duration, max: Duration) -> Self {
		Self { base, max, attempt: 0 }
	}

	/// Returns the next delay and advances the attempt counter.
	///
	/// Delays run `base, base*2, base*4, ...` up to `max`.
	pub fn next_delay(&mut self) -> Duration {
		let multiplier = FACTOR.saturating_pow(self.attempt.min(31));
		let delay = self.base.saturating_mul(multiplier).min(self.max);
		self.attempt = self.attempt.saturating_add(1);
		delay
	}

	pub fn reset(&mut self) {
		self.attempt = 0;
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}
}

impl Default for Backoff {
	fn default() -> Self {
		Self::new(Duration::from_millis(500), Duration::from_secs(30))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delays_double_until_capped() {
		let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
		assert_eq!(backoff.next_delay(), Duration::from_millis(100));
		assert_eq!(backoff.next_delay(), Duration::from_millis(200));
		assert_eq!(backoff.next_delay(), Duration::from_millis(400));
		assert_eq!(backoff.next_delay(), Duration::from_millis(500));
		assert_eq!(backoff.next_delay(), Duration::from_millis(500));
		assert_eq!(backoff.attempt(), 5);
	}

	#[test]
	fn reset_starts_over() {
		let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
		let _ = backoff.next_delay();
		let _ = backoff.next_delay();
		backoff.reset();
		assert_eq!(backoff.next_delay(), Duration::from_millis(100));
	}

	#[test]
	fn huge_attempt_counts_do_not_overflow() {
		let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
		for _ in 0..100 {
			assert!(backoff.next_delay() <= Duration::from_secs(60));
		}
	}
}
