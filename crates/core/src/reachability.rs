//! Network reachability observer.
//!
//! The observer only records and fans out state. Something else (an OS hook,
//! a polling probe such as `courier_runtime::probe`) calls [`ReachabilityObserver::update`].

use courier_protocol::ReachabilityState;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Records the current reachability state and delivers every transition to subscribers.
///
/// Transitions reach each subscriber in the order they happened. A new
/// subscriber first receives the current state, so subscribers must treat a
/// repeated state as a no-op.
#[derive(Debug, Default)]
pub struct ReachabilityObserver {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	state: ReachabilityState,
	subscribers: Vec<mpsc::UnboundedSender<ReachabilityState>>,
}

impl ReachabilityObserver {
	pub fn new(initial: ReachabilityState) -> Self {
		Self {
			inner: Mutex::new(Inner {
				state: initial,
				subscribers: Vec::new(),
			}),
		}
	}

	pub fn current_state(&self) -> ReachabilityState {
		self.inner.lock().state
	}

	pub fn is_reachable(&self) -> bool {
		self.current_state().allows_dispatch()
	}

	/// Records a new state; returns `false` when it equals the current one.
	///
	/// Delivery happens under the observer lock so concurrent updates reach
	/// every subscriber in the same order.
	pub fn update(&self, state: ReachabilityState) -> bool {
		let mut inner = self.inner.lock();
		if inner.state == state {
			return false;
		}
		info!(target = "courier.reachability", from = ?inner.state, to = ?state, "reachability changed");
		inner.state = state;
		inner.subscribers.retain(|tx| tx.send(state).is_ok());
		true
	}

	/// Subscribes to transitions, starting with the current state.
	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ReachabilityState> {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut inner = self.inner.lock();
		let _ = tx.send(inner.state);
		inner.subscribers.push(tx);
		debug!(target = "courier.reachability", subscribers = inner.subscribers.len(), "subscriber added");
		rx
	}

	/// Data arrived from the network, so it is reachable whatever the last probe said.
	pub fn note_data_received(&self) {
		if self.current_state() == ReachabilityState::Unreachable {
			let _ = self.update(ReachabilityState::Reachable);
		}
	}
}
