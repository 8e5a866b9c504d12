//! Session orchestrator.
//!
//! A [`Session`] wires the credential handler, reachability observer,
//! scheduler and push channel together and runs one event loop task that
//! serializes reachability and credential transitions with admission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_protocol::{BackgroundTask, Credential, EnqueueResult, PushChannelState, ReachabilityState};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::background::BackgroundCompletions;
use crate::bus::{BusMembership, SessionBus};
use crate::config::SessionConfig;
use crate::credential::{CredentialEvent, CredentialHandler, CredentialRenewer, CredentialStore, MemoryCredentialStore};
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::push_channel::{PushChannel, PushChannelConsumer};
use crate::reachability::ReachabilityObserver;
use crate::request::{HttpRequest, RequestGenerator, RequestId, WorkItem};
use crate::scheduler::{Admission, GeneratorId, RequestScheduler};
use crate::transport::{PushTransport, Transport};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Told about traffic and connectivity as the session observes them.
pub trait NetworkStateDelegate: Send + Sync {
	/// A response arrived from the server.
	fn did_receive_data(&self);

	/// The reachability observer reported the network as unreachable.
	fn did_go_offline(&self);
}

/// Builder for [`Session`].
pub struct SessionBuilder {
	transport: Arc<dyn Transport>,
	push_transport: Option<Arc<dyn PushTransport>>,
	renewer: Option<Arc<dyn CredentialRenewer>>,
	store: Option<Arc<dyn CredentialStore>>,
	reachability: Option<Arc<ReachabilityObserver>>,
	config: SessionConfig,
	bus: Option<SessionBus>,
	name: Option<String>,
}

impl SessionBuilder {
	pub fn push_transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
		self.push_transport = Some(transport);
		self
	}

	pub fn renewer(mut self, renewer: Arc<dyn CredentialRenewer>) -> Self {
		self.renewer = Some(renewer);
		self
	}

	pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Shares an existing observer; by default each session gets its own.
	pub fn reachability(mut self, observer: Arc<ReachabilityObserver>) -> Self {
		self.reachability = Some(observer);
		self
	}

	pub fn config(mut self, config: SessionConfig) -> Self {
		self.config = config;
		self
	}

	/// Joins `bus` instead of [`SessionBus::global`].
	pub fn bus(mut self, bus: SessionBus) -> Self {
		self.bus = Some(bus);
		self
	}

	/// Label used in logs and as the sender of bus notifications.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	/// Builds the session and starts its event loop on the current Tokio runtime.
	pub fn build(self) -> Result<Session> {
		let runtime = Handle::try_current().map_err(|err| Error::Runtime(err.to_string()))?;
		let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
		let name = self.name.unwrap_or_else(|| format!("session-{id}"));
		let store = self.store.unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));
		let renewer = self.renewer.unwrap_or_else(|| Arc::new(NoRenewer));
		let reachability = self.reachability.unwrap_or_default();
		let bus = self.bus.unwrap_or_else(|| SessionBus::global().clone());

		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let credentials = CredentialHandler::new(renewer, store, runtime.clone());
		let push = PushChannel::new(
			self.push_transport,
			credentials.clone(),
			Arc::clone(&reachability),
			self.config.push_reconnect.backoff(),
			events_tx.clone(),
			runtime.clone(),
		);
		let scheduler = RequestScheduler::new(
			&self.config,
			self.transport.clone(),
			credentials.clone(),
			Arc::clone(&reachability),
			push.clone(),
			events_tx.clone(),
			runtime.clone(),
		);

		let membership = bus.join();
		let bus_waker = membership.waker();
		let credential_rx = credentials.subscribe();
		let reachability_rx = reachability.subscribe();

		let inner = Arc::new(SessionInner {
			id,
			name,
			credentials,
			reachability,
			push,
			scheduler,
			transport: self.transport,
			background: BackgroundCompletions::new(),
			bus,
			events: events_tx,
			membership: Mutex::new(Some(membership)),
			network_delegate: Mutex::new(None),
			event_loop: Mutex::new(None),
			runtime: runtime.clone(),
		});

		let event_loop = runtime.spawn(run_event_loop(
			Arc::downgrade(&inner),
			EventSources {
				events: events_rx,
				reachability: reachability_rx,
				credentials: credential_rx,
				bus: bus_waker,
			},
		));
		*inner.event_loop.lock() = Some(event_loop);
		info!(target = "courier.session", session = %inner.name, max_concurrent = self.config.max_concurrent, "session started");
		Ok(Session { inner })
	}
}

/// Renewer used when none is configured: renewal always fails.
struct NoRenewer;

impl CredentialRenewer for NoRenewer {
	fn renew<'a>(&'a self, _previous: Option<&'a Credential>) -> futures_util::future::BoxFuture<'a, Result<Credential>> {
		Box::pin(async { Err(Error::AuthenticationFailed) })
	}
}

struct SessionInner {
	id: u64,
	name: String,
	credentials: CredentialHandler,
	reachability: Arc<ReachabilityObserver>,
	push: PushChannel,
	scheduler: RequestScheduler,
	transport: Arc<dyn Transport>,
	background: BackgroundCompletions,
	bus: SessionBus,
	events: mpsc::UnboundedSender<SessionEvent>,
	membership: Mutex<Option<BusMembership>>,
	network_delegate: Mutex<Option<Arc<dyn NetworkStateDelegate>>>,
	event_loop: Mutex<Option<JoinHandle<()>>>,
	runtime: Handle,
}

impl Drop for SessionInner {
	fn drop(&mut self) {
		if let Some(event_loop) = self.event_loop.get_mut().take() {
			event_loop.abort();
		}
	}
}

impl SessionInner {
	fn handle_event(&self, event: SessionEvent) {
		trace!(target = "courier.session", session = %self.name, ?event, "session event");
		match event {
			SessionEvent::ProcessRequests => self.scheduler.process(),
			SessionEvent::ProcessRequestsAfter(delay) => self.send_after(delay, SessionEvent::ProcessRequests),
			SessionEvent::RequestFinished { received_data } => {
				if received_data {
					self.reachability.note_data_received();
					let delegate = self.network_delegate.lock().clone();
					if let Some(delegate) = delegate {
						delegate.did_receive_data();
					}
				}
				self.scheduler.process();
				let _ = self.bus.notify(&self.name);
			}
			SessionEvent::OpenPushChannel => {
				let _ = self.scheduler.enqueue(WorkItem::OpenPushChannel);
			}
			SessionEvent::OpenPushChannelAfter(delay) => self.send_after(delay, SessionEvent::OpenPushChannel),
		}
	}

	fn handle_reachability(&self, state: ReachabilityState) {
		debug!(target = "courier.session", session = %self.name, ?state, "reachability transition");
		self.scheduler.on_reachability_changed(state);
		self.push.on_reachability_changed(state);
		if state == ReachabilityState::Unreachable {
			let delegate = self.network_delegate.lock().clone();
			if let Some(delegate) = delegate {
				delegate.did_go_offline();
			}
		} else {
			self.scheduler.process();
		}
	}

	fn handle_credential(&self, event: CredentialEvent) {
		match event {
			CredentialEvent::Renewed(_) => self.scheduler.on_credential_renewed(),
			CredentialEvent::RenewalFailed => self.scheduler.on_credential_failed(),
		}
	}

	fn send_after(&self, delay: Duration, event: SessionEvent) {
		let events = self.events.clone();
		drop(self.runtime.spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = events.send(event);
		}));
	}
}

struct EventSources {
	events: mpsc::UnboundedReceiver<SessionEvent>,
	reachability: mpsc::UnboundedReceiver<ReachabilityState>,
	credentials: mpsc::UnboundedReceiver<CredentialEvent>,
	bus: Arc<tokio::sync::Notify>,
}

async fn run_event_loop(session: Weak<SessionInner>, mut sources: EventSources) {
	loop {
		tokio::select! {
			biased;
			Some(state) = sources.reachability.recv() => {
				let Some(inner) = session.upgrade() else { break };
				inner.handle_reachability(state);
			}
			Some(event) = sources.credentials.recv() => {
				let Some(inner) = session.upgrade() else { break };
				inner.handle_credential(event);
			}
			Some(event) = sources.events.recv() => {
				let Some(inner) = session.upgrade() else { break };
				inner.handle_event(event);
			}
			() = sources.bus.notified() => {
				let Some(inner) = session.upgrade() else { break };
				inner.scheduler.process();
			}
		}
	}
	trace!(target = "courier.session", "session event loop stopped");
}

/// A transport session: the public face of the scheduler, credential handler
/// and push channel.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

impl Session {
	pub fn builder(transport: Arc<dyn Transport>) -> SessionBuilder {
		SessionBuilder {
			transport,
			push_transport: None,
			renewer: None,
			store: None,
			reachability: None,
			config: SessionConfig::default(),
			bus: None,
			name: None,
		}
	}

	/// Wakes every session on the global bus to pull new work.
	///
	/// Sessions built with their own [`SessionBus`] are not reached; call
	/// [`SessionBus::notify`] on that bus instead.
	pub fn notify_new_requests_available(sender: &str) -> usize {
		SessionBus::global().notify(sender)
	}

	pub fn id(&self) -> u64 {
		self.inner.id
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Hands a request to the scheduler; its completion reports the outcome.
	pub fn enqueue_request(&self, request: HttpRequest) -> Admission {
		self.inner.scheduler.enqueue(WorkItem::Http(request))
	}

	/// Offers a free slot to `generator` without blocking.
	///
	/// The generator is called only when a slot is available; returning `None`
	/// leaves the slot free.
	pub fn attempt_to_enqueue_sync_request(&self, generator: impl FnOnce() -> Option<HttpRequest>) -> EnqueueResult {
		let (result, admission) = self.inner.scheduler.attempt(generator);
		trace!(target = "courier.session", session = %self.inner.name, ?result, ?admission, "sync enqueue attempt");
		result
	}

	/// Registers a generator pulled round-robin whenever a slot frees up.
	pub fn register_generator(&self, generator: impl RequestGenerator + 'static) -> GeneratorId {
		let id = self.inner.scheduler.register_generator(Arc::new(generator));
		let _ = self.inner.events.send(SessionEvent::ProcessRequests);
		id
	}

	pub fn unregister_generator(&self, id: GeneratorId) -> bool {
		self.inner.scheduler.unregister_generator(id)
	}

	/// Re-runs the pull loop of this session only.
	pub fn process_requests(&self) {
		let _ = self.inner.events.send(SessionEvent::ProcessRequests);
	}

	pub fn cancel(&self, id: RequestId) -> bool {
		self.inner.scheduler.cancel(id)
	}

	/// Changes the concurrency budget; takes effect at the next admission check.
	pub fn set_max_concurrent(&self, max_concurrent: usize) {
		self.inner.scheduler.set_max_concurrent(max_concurrent);
		let _ = self.inner.events.send(SessionEvent::ProcessRequests);
	}

	pub fn max_concurrent(&self) -> usize {
		self.inner.scheduler.max_concurrent()
	}

	/// Slots currently occupied.
	pub fn in_flight(&self) -> usize {
		self.inner.scheduler.in_flight()
	}

	/// Requests waiting for a slot.
	pub fn pending_count(&self) -> usize {
		self.inner.scheduler.pending_count()
	}

	/// Requests waiting for a credential renewal.
	pub fn awaiting_credential_count(&self) -> usize {
		self.inner.scheduler.awaiting_credential_count()
	}

	/// Opens the push channel, delivering to `consumer` on the current runtime.
	pub fn open_push_channel(&self, consumer: Arc<dyn PushChannelConsumer>) -> Result<()> {
		let delivery = self.inner.runtime.clone();
		self.configure_push_channel(consumer, &delivery);
		self.inner.push.open()
	}

	/// Sets the push consumer and the runtime its callbacks run on.
	pub fn configure_push_channel(&self, consumer: Arc<dyn PushChannelConsumer>, delivery: &Handle) {
		self.inner.push.configure(consumer, delivery);
	}

	pub fn close_push_channel(&self) {
		self.inner.push.close();
	}

	pub fn push_channel(&self) -> &PushChannel {
		&self.inner.push
	}

	pub fn push_channel_state(&self) -> PushChannelState {
		self.inner.push.state()
	}

	pub fn credentials(&self) -> &CredentialHandler {
		&self.inner.credentials
	}

	/// Installs a credential obtained out of band (for example after login).
	pub fn set_credential(&self, credential: Credential) {
		self.inner.credentials.set_credential(credential);
	}

	pub fn set_access_token_renewal_success_handler(&self, handler: impl Fn(&Credential) + Send + Sync + 'static) {
		self.inner.credentials.set_renewal_success_callback(handler);
	}

	pub fn set_access_token_renewal_failure_handler(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
		self.inner.credentials.set_renewal_failure_callback(handler);
	}

	pub fn reachability(&self) -> &Arc<ReachabilityObserver> {
		&self.inner.reachability
	}

	pub fn set_network_state_delegate(&self, delegate: Option<Arc<dyn NetworkStateDelegate>>) {
		*self.inner.network_delegate.lock() = delegate;
	}

	/// Called with the path of a request dispatched suspiciously often.
	pub fn set_request_loop_detection_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
		self.inner.scheduler.set_loop_callback(Some(Arc::new(callback)));
	}

	/// Stores the host's completion handler for a background transfer session.
	pub fn register_completion_handler(&self, identifier: impl Into<String>, handler: impl FnOnce() + Send + 'static) {
		let _ = self.inner.background.register(identifier, handler);
	}

	/// Runs the completion handler once the host's background events are processed.
	pub fn finish_background_events(&self, identifier: &str) -> bool {
		self.inner.background.finish(identifier)
	}

	/// Transfers currently owned by the background transport.
	pub async fn list_background_tasks(&self) -> Vec<BackgroundTask> {
		self.inner.transport.background_tasks().await
	}

	/// Cancels all work, closes the push channel and leaves the bus.
	pub fn tear_down(&self) {
		info!(target = "courier.session", session = %self.inner.name, "tearing down session");
		self.inner.push.tear_down();
		self.inner.scheduler.tear_down();
		drop(self.inner.membership.lock().take());
		if let Some(event_loop) = self.inner.event_loop.lock().take() {
			event_loop.abort();
		}
	}
}
