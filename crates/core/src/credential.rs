//! Credential handling with single-flight renewal.
//!
//! [`CredentialHandler`] owns the current access credential. Any number of
//! callers may discover that it is missing, expired, or rejected, but at most
//! one renewal runs at a time and every waiter receives its result.

use std::sync::Arc;

use courier_protocol::Credential;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Obtains a fresh credential from the server.
pub trait CredentialRenewer: Send + Sync {
	/// `previous` is the credential being replaced, if any.
	fn renew<'a>(&'a self, previous: Option<&'a Credential>) -> BoxFuture<'a, Result<Credential>>;
}

/// Durable storage for the last good credential.
pub trait CredentialStore: Send + Sync {
	fn load(&self) -> Result<Option<Credential>>;

	fn save(&self, credential: &Credential) -> Result<()>;

	/// Removes the stored credential; returns `false` when there was none.
	fn clear(&self) -> Result<bool>;
}

/// Keeps the credential in memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
	slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_credential(credential: Credential) -> Self {
		Self {
			slot: Mutex::new(Some(credential)),
		}
	}
}

impl CredentialStore for MemoryCredentialStore {
	fn load(&self) -> Result<Option<Credential>> {
		Ok(self.slot.lock().clone())
	}

	fn save(&self, credential: &Credential) -> Result<()> {
		*self.slot.lock() = Some(credential.clone());
		Ok(())
	}

	fn clear(&self) -> Result<bool> {
		Ok(self.slot.lock().take().is_some())
	}
}

/// Answer of [`CredentialHandler::ensure_valid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureValid {
	/// A usable credential is available now.
	AlreadyValid(Credential),
	/// A renewal is running; wait for [`CredentialEvent::Renewed`].
	RenewalStarted,
	/// The last renewal failed and none will be attempted until reset.
	RenewalFailed,
}

/// Renewal outcomes broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialEvent {
	Renewed(Credential),
	RenewalFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Idle,
	Renewing,
	Failed,
}

type Waiter = oneshot::Sender<Option<Credential>>;
type SuccessCallback = Arc<dyn Fn(&Credential) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(&Error) + Send + Sync>;

struct State {
	credential: Option<Credential>,
	phase: Phase,
	waiters: Vec<Waiter>,
	renewals: u64,
}

struct Shared {
	state: Mutex<State>,
	renewer: Arc<dyn CredentialRenewer>,
	store: Arc<dyn CredentialStore>,
	on_success: Mutex<Option<SuccessCallback>>,
	on_failure: Mutex<Option<FailureCallback>>,
	listeners: Mutex<Vec<mpsc::UnboundedSender<CredentialEvent>>>,
	runtime: Handle,
}

/// Owns the session's credential and coordinates its renewal.
#[derive(Clone)]
pub struct CredentialHandler {
	shared: Arc<Shared>,
}

impl CredentialHandler {
	/// Creates a handler seeded from `store`.
	///
	/// A store that fails to load is logged and treated as empty.
	pub fn new(renewer: Arc<dyn CredentialRenewer>, store: Arc<dyn CredentialStore>, runtime: Handle) -> Self {
		let credential = match store.load() {
			Ok(credential) => credential,
			Err(err) => {
				warn!(target = "courier.credential", error = %err, "failed to load stored credential");
				None
			}
		};
		debug!(target = "courier.credential", stored = credential.is_some(), "credential handler created");
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(State {
					credential,
					phase: Phase::Idle,
					waiters: Vec::new(),
					renewals: 0,
				}),
				renewer,
				store,
				on_success: Mutex::new(None),
				on_failure: Mutex::new(None),
				listeners: Mutex::new(Vec::new()),
				runtime,
			}),
		}
	}

	/// The stored credential, which may already be expired.
	pub fn current(&self) -> Option<Credential> {
		self.shared.state.lock().credential.clone()
	}

	/// Returns the credential if usable; otherwise makes sure a renewal is running.
	pub fn ensure_valid(&self) -> EnsureValid {
		let mut state = self.shared.state.lock();
		match state.phase {
			Phase::Renewing => EnsureValid::RenewalStarted,
			Phase::Failed => EnsureValid::RenewalFailed,
			Phase::Idle => match state.credential.as_ref().filter(|credential| credential.is_valid()) {
				Some(credential) => EnsureValid::AlreadyValid(credential.clone()),
				None => {
					self.start_renewal(&mut state);
					EnsureValid::RenewalStarted
				}
			},
		}
	}

	/// Waits for a usable credential, renewing if needed.
	pub async fn valid_credential(&self) -> Result<Credential> {
		let rx = {
			let mut state = self.shared.state.lock();
			match state.phase {
				Phase::Failed => return Err(Error::AuthenticationFailed),
				Phase::Renewing => {}
				Phase::Idle => {
					if let Some(credential) = state.credential.as_ref().filter(|credential| credential.is_valid()) {
						return Ok(credential.clone());
					}
					self.start_renewal(&mut state);
				}
			}
			let (tx, rx) = oneshot::channel();
			state.waiters.push(tx);
			rx
		};
		rx.await.ok().flatten().ok_or(Error::AuthenticationFailed)
	}

	/// Reports that the server rejected `rejected` as unauthorized.
	///
	/// Only the first report for a given credential starts a renewal; reports
	/// arriving while one runs, or for a credential already replaced, are folded in.
	pub fn on_request_rejected_as_unauthorized(&self, rejected: Option<&Credential>) {
		let mut state = self.shared.state.lock();
		if state.phase != Phase::Idle {
			debug!(target = "courier.credential", phase = ?state.phase, "rejection folded into current renewal");
			return;
		}
		if let (Some(current), Some(rejected)) = (state.credential.as_ref(), rejected) {
			if current.token != rejected.token {
				debug!(target = "courier.credential", "rejected credential already replaced");
				return;
			}
		}
		info!(target = "courier.credential", "credential rejected by server");
		state.credential = None;
		self.start_renewal(&mut state);
	}

	/// Installs a credential obtained elsewhere (login) and clears any failure.
	pub fn set_credential(&self, credential: Credential) {
		{
			let mut state = self.shared.state.lock();
			for waiter in state.waiters.drain(..) {
				let _ = waiter.send(Some(credential.clone()));
			}
			state.credential = Some(credential.clone());
			state.phase = Phase::Idle;
		}
		if let Err(err) = self.shared.store.save(&credential) {
			warn!(target = "courier.credential", error = %err, "failed to persist credential");
		}
		info!(target = "courier.credential", "credential installed");
		self.shared.broadcast(CredentialEvent::Renewed(credential));
	}

	/// Forgets the credential (logout) and clears the store.
	pub fn clear(&self) {
		{
			let mut state = self.shared.state.lock();
			state.credential = None;
			if state.phase == Phase::Failed {
				state.phase = Phase::Idle;
			}
		}
		if let Err(err) = self.shared.store.clear() {
			warn!(target = "courier.credential", error = %err, "failed to clear stored credential");
		}
	}

	/// Leaves the failed state so the next admission may renew again.
	pub fn reset(&self) -> bool {
		let mut state = self.shared.state.lock();
		if state.phase != Phase::Failed {
			return false;
		}
		debug!(target = "courier.credential", "renewal failure reset");
		state.phase = Phase::Idle;
		true
	}

	pub fn is_renewing(&self) -> bool {
		self.shared.state.lock().phase == Phase::Renewing
	}

	pub fn renewal_failed(&self) -> bool {
		self.shared.state.lock().phase == Phase::Failed
	}

	/// Number of renewals started since creation.
	pub fn renewal_count(&self) -> u64 {
		self.shared.state.lock().renewals
	}

	/// Receives every renewal outcome from now on.
	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CredentialEvent> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.shared.listeners.lock().push(tx);
		rx
	}

	pub fn set_renewal_success_callback(&self, callback: impl Fn(&Credential) + Send + Sync + 'static) {
		*self.shared.on_success.lock() = Some(Arc::new(callback));
	}

	pub fn set_renewal_failure_callback(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
		*self.shared.on_failure.lock() = Some(Arc::new(callback));
	}

	fn start_renewal(&self, state: &mut State) {
		state.phase = Phase::Renewing;
		state.renewals += 1;
		info!(target = "courier.credential", renewal = state.renewals, "starting credential renewal");
		let previous = state.credential.clone();
		let shared = Arc::clone(&self.shared);
		drop(self.shared.runtime.spawn(async move {
			let result = shared.renewer.renew(previous.as_ref()).await;
			shared.finish_renewal(result);
		}));
	}
}

impl Shared {
	fn finish_renewal(&self, result: Result<Credential>) {
		let result = result.and_then(|credential| {
			if credential.is_valid() {
				Ok(credential)
			} else {
				Err(Error::Unauthorized("renewer returned an unusable credential".to_string()))
			}
		});
		match result {
			Ok(credential) => {
				if let Err(err) = self.store.save(&credential) {
					warn!(target = "courier.credential", error = %err, "failed to persist credential");
				}
				{
					let mut state = self.state.lock();
					for waiter in state.waiters.drain(..) {
						let _ = waiter.send(Some(credential.clone()));
					}
					state.credential = Some(credential.clone());
					state.phase = Phase::Idle;
				}
				info!(target = "courier.credential", "credential renewed");
				let callback = self.on_success.lock().clone();
				if let Some(callback) = callback {
					callback(&credential);
				}
				self.broadcast(CredentialEvent::Renewed(credential));
			}
			Err(err) => {
				{
					let mut state = self.state.lock();
					for waiter in state.waiters.drain(..) {
						let _ = waiter.send(None);
					}
					state.phase = Phase::Failed;
				}
				warn!(target = "courier.credential", error = %err, "credential renewal failed");
				let callback = self.on_failure.lock().clone();
				if let Some(callback) = callback {
					callback(&err);
				}
				self.broadcast(CredentialEvent::RenewalFailed);
			}
		}
	}

	fn broadcast(&self, event: CredentialEvent) {
		self.listeners.lock().retain(|tx| tx.send(event.clone()).is_ok());
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;
	use crate::testing::FakeRenewer;

	fn handler(renewer: &Arc<FakeRenewer>, store: Arc<dyn CredentialStore>) -> CredentialHandler {
		CredentialHandler::new(Arc::clone(renewer) as Arc<dyn CredentialRenewer>, store, Handle::current())
	}

	#[tokio::test]
	async fn valid_stored_credential_is_used_without_renewal() {
		let renewer = Arc::new(FakeRenewer::new());
		let store = Arc::new(MemoryCredentialStore::with_credential(Credential::bearer("stored").expiring_in(3600)));
		let handler = handler(&renewer, store);

		assert!(matches!(handler.ensure_valid(), EnsureValid::AlreadyValid(c) if c.token == "stored"));
		assert_eq!(renewer.calls(), 0);
	}

	#[tokio::test]
	async fn concurrent_demand_triggers_one_renewal() {
		let renewer = Arc::new(FakeRenewer::held());
		let handler = handler(&renewer, Arc::new(MemoryCredentialStore::new()));

		assert_eq!(handler.ensure_valid(), EnsureValid::RenewalStarted);
		assert_eq!(handler.ensure_valid(), EnsureValid::RenewalStarted);
		let waiters: Vec<_> = (0..3)
			.map(|_| {
				let handler = handler.clone();
				tokio::spawn(async move { handler.valid_credential().await })
			})
			.collect();

		renewer.release(1);
		for waiter in waiters {
			let credential = waiter.await.unwrap().unwrap();
			assert_eq!(credential.token, "token-1");
		}
		assert_eq!(renewer.calls(), 1);
		assert_eq!(handler.renewal_count(), 1);
	}

	#[tokio::test]
	async fn renewed_credential_is_persisted_and_broadcast() {
		let renewer = Arc::new(FakeRenewer::new());
		let store = Arc::new(MemoryCredentialStore::new());
		let handler = handler(&renewer, store.clone());
		let mut events = handler.subscribe();
		let successes = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&successes);
		handler.set_renewal_success_callback(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		});

		let credential = handler.valid_credential().await.unwrap();
		assert_eq!(store.load().unwrap(), Some(credential.clone()));
		let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap();
		assert_eq!(event, Some(CredentialEvent::Renewed(credential)));
		assert_eq!(successes.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failure_is_sticky_until_reset() {
		let renewer = Arc::new(FakeRenewer::new());
		renewer.set_failing(true);
		let handler = handler(&renewer, Arc::new(MemoryCredentialStore::new()));
		let failures = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&failures);
		handler.set_renewal_failure_callback(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		});

		assert!(matches!(handler.valid_credential().await, Err(Error::AuthenticationFailed)));
		assert_eq!(handler.ensure_valid(), EnsureValid::RenewalFailed);
		assert_eq!(renewer.calls(), 1);
		assert_eq!(failures.load(Ordering::SeqCst), 1);

		renewer.set_failing(false);
		assert!(handler.reset());
		assert!(handler.valid_credential().await.is_ok());
		assert_eq!(renewer.calls(), 2);
	}

	#[tokio::test]
	async fn rejection_of_a_replaced_credential_is_ignored() {
		let renewer = Arc::new(FakeRenewer::new());
		let current = Credential::bearer("current").expiring_in(3600);
		let handler = handler(&renewer, Arc::new(MemoryCredentialStore::with_credential(current.clone())));

		handler.on_request_rejected_as_unauthorized(Some(&Credential::bearer("old")));
		assert!(!handler.is_renewing());
		assert_eq!(handler.current(), Some(current.clone()));

		handler.on_request_rejected_as_unauthorized(Some(&current));
		handler.on_request_rejected_as_unauthorized(Some(&current));
		let renewed = handler.valid_credential().await.unwrap();
		assert_eq!(renewed.token, "token-1");
		assert_eq!(renewer.calls(), 1);
	}

	#[tokio::test]
	async fn set_credential_clears_failure() {
		let renewer = Arc::new(FakeRenewer::new());
		renewer.set_failing(true);
		let handler = handler(&renewer, Arc::new(MemoryCredentialStore::new()));
		assert!(handler.valid_credential().await.is_err());

		handler.set_credential(Credential::bearer("login"));
		assert!(!handler.renewal_failed());
		assert!(matches!(handler.ensure_valid(), EnsureValid::AlreadyValid(c) if c.token == "login"));
	}

	#[tokio::test]
	async fn expired_renewal_result_counts_as_failure() {
		let renewer = Arc::new(FakeRenewer::new());
		renewer.set_issued_expiry(Some(1));
		let handler = handler(&renewer, Arc::new(MemoryCredentialStore::new()));

		assert!(handler.valid_credential().await.is_err());
		assert!(handler.renewal_failed());
	}
}
