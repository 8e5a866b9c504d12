//! Process-scoped "new requests may be available" broadcast.
//!
//! Sessions join a [`SessionBus`] when they are built and leave it when they
//! are torn down or dropped. A notification carries no payload: every member
//! simply re-runs its own admission loop.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

static GLOBAL_BUS: LazyLock<SessionBus> = LazyLock::new(SessionBus::new);

/// Registry of live sessions that can be woken together.
#[derive(Clone, Default)]
pub struct SessionBus {
	inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
	next_id: u64,
	members: HashMap<u64, Arc<Notify>>,
}

impl SessionBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// The bus shared by every session in the process unless built with its own.
	pub fn global() -> &'static SessionBus {
		&GLOBAL_BUS
	}

	/// Adds a member; the returned membership leaves the bus when dropped.
	pub fn join(&self) -> BusMembership {
		let notify = Arc::new(Notify::new());
		let mut inner = self.inner.lock();
		inner.next_id += 1;
		let id = inner.next_id;
		let _ = inner.members.insert(id, Arc::clone(&notify));
		BusMembership {
			bus: Arc::downgrade(&self.inner),
			id,
			notify,
		}
	}

	/// Wakes every member; returns how many were woken.
	///
	/// [`Session::notify_new_requests_available`](crate::Session::notify_new_requests_available)
	/// calls this on [`SessionBus::global`] only.
	///
	/// Repeated notifications before a member wakes collapse into one.
	pub fn notify(&self, sender: &str) -> usize {
		let inner = self.inner.lock();
		trace!(target = "courier.session", sender, members = inner.members.len(), "new requests available");
		for notify in inner.members.values() {
			notify.notify_one();
		}
		inner.members.len()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// A session's place on a [`SessionBus`].
pub struct BusMembership {
	bus: Weak<Mutex<BusInner>>,
	id: u64,
	notify: Arc<Notify>,
}

impl BusMembership {
	/// Resolves at the next notification (or immediately if one is stored).
	pub async fn notified(&self) {
		self.notify.notified().await;
	}

	pub(crate) fn waker(&self) -> Arc<Notify> {
		Arc::clone(&self.notify)
	}
}

impl Drop for BusMembership {
	fn drop(&mut self) {
		if let Some(bus) = self.bus.upgrade() {
			let _ = bus.lock().members.remove(&self.id);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn notify_wakes_every_member() {
		let bus = SessionBus::new();
		let a = bus.join();
		let b = bus.join();

		assert_eq!(bus.notify("test"), 2);

		tokio::time::timeout(Duration::from_secs(1), a.notified()).await.unwrap();
		tokio::time::timeout(Duration::from_secs(1), b.notified()).await.unwrap();
	}

	#[test]
	fn dropping_membership_leaves_the_bus() {
		let bus = SessionBus::new();
		let membership = bus.join();
		assert_eq!(bus.len(), 1);
		drop(membership);
		assert!(bus.is_empty());
		assert_eq!(bus.notify("test"), 0);
	}
}
