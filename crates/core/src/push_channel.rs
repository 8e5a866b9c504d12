//! Long-lived push channel.
//!
//! The channel is opened through the scheduler (so it waits for reachability
//! and a valid credential) but does not count against the concurrency budget.
//! Closing is explicit or caused by reachability loss, transport failure, or
//! credential rejection; only an explicit close cancels the wish to be open.

use std::sync::Arc;

use courier_protocol::{Credential, PushChannelState, PushFrame, ReachabilityState};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::credential::CredentialHandler;
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::reachability::ReachabilityObserver;
use crate::transport::{PushSender, PushTransport, PushTransportParts};

/// Receives push channel events on the delivery runtime chosen at configuration.
pub trait PushChannelConsumer: Send + Sync + 'static {
	fn push_channel_did_receive(&self, frame: PushFrame);

	fn push_channel_did_open(&self) {}

	fn push_channel_did_close(&self) {}
}

/// Why the channel last closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
	Explicit,
	ReachabilityLost,
	TransportError,
	Unauthorized,
}

enum ConsumerEvent {
	Opened,
	Frame(PushFrame),
	Closed,
}

struct PushState {
	phase: PushChannelState,
	wanted: bool,
	last_close: Option<CloseCause>,
	/// Bumped whenever a connection attempt is started or abandoned.
	generation: u64,
	reader: Option<AbortHandle>,
	consumer: Option<mpsc::UnboundedSender<ConsumerEvent>>,
	reconnect: Backoff,
}

struct Shared {
	state: Mutex<PushState>,
	sender: tokio::sync::Mutex<Option<(u64, Box<dyn PushSender>)>>,
	transport: Option<Arc<dyn PushTransport>>,
	credentials: CredentialHandler,
	reachability: Arc<ReachabilityObserver>,
	events: mpsc::UnboundedSender<SessionEvent>,
	runtime: Handle,
}

/// Handle to the session's push channel.
#[derive(Clone)]
pub struct PushChannel {
	shared: Arc<Shared>,
}

impl PushChannel {
	pub(crate) fn new(
		transport: Option<Arc<dyn PushTransport>>,
		credentials: CredentialHandler,
		reachability: Arc<ReachabilityObserver>,
		reconnect: Backoff,
		events: mpsc::UnboundedSender<SessionEvent>,
		runtime: Handle,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(PushState {
					phase: PushChannelState::Closed,
					wanted: false,
					last_close: None,
					generation: 0,
					reader: None,
					consumer: None,
					reconnect,
				}),
				sender: tokio::sync::Mutex::new(None),
				transport,
				credentials,
				reachability,
				events,
				runtime,
			}),
		}
	}

	pub fn state(&self) -> PushChannelState {
		self.shared.state.lock().phase
	}

	/// Whether the channel should be open (or reopened when conditions allow).
	pub fn wants_open(&self) -> bool {
		self.shared.state.lock().wanted
	}

	pub fn last_close_cause(&self) -> Option<CloseCause> {
		self.shared.state.lock().last_close
	}

	pub fn has_transport(&self) -> bool {
		self.shared.transport.is_some()
	}

	/// Routes consumer callbacks through a task on `delivery`, one at a time and in order.
	pub fn configure(&self, consumer: Arc<dyn PushChannelConsumer>, delivery: &Handle) {
		let (tx, mut rx) = mpsc::unbounded_channel::<ConsumerEvent>();
		drop(delivery.spawn(async move {
			while let Some(event) = rx.recv().await {
				match event {
					ConsumerEvent::Opened => consumer.push_channel_did_open(),
					ConsumerEvent::Frame(frame) => consumer.push_channel_did_receive(frame),
					ConsumerEvent::Closed => consumer.push_channel_did_close(),
				}
			}
		}));
		self.shared.state.lock().consumer = Some(tx);
	}

	/// Declares that the channel should be open; the scheduler opens it when it can.
	///
	/// While a previous close is still `Closing`, the reopen is issued once it finishes.
	pub fn open(&self) -> Result<()> {
		if self.shared.transport.is_none() {
			return Err(Error::Invalid("session has no push transport".to_string()));
		}
		let mut state = self.shared.state.lock();
		state.wanted = true;
		if state.phase == PushChannelState::Closed {
			debug!(target = "courier.push", "push channel open requested");
			let _ = self.shared.events.send(SessionEvent::OpenPushChannel);
		}
		Ok(())
	}

	/// Closes the channel and cancels any reopen.
	pub fn close(&self) {
		let closing = {
			let mut state = self.shared.state.lock();
			state.wanted = false;
			match state.phase {
				PushChannelState::Closed | PushChannelState::Closing => return,
				PushChannelState::Opening => {
					state.generation += 1;
					state.phase = PushChannelState::Closed;
					state.last_close = Some(CloseCause::Explicit);
					None
				}
				PushChannelState::Open => {
					let previous = state.generation;
					state.generation += 1;
					state.phase = PushChannelState::Closing;
					state.last_close = Some(CloseCause::Explicit);
					if let Some(reader) = state.reader.take() {
						reader.abort();
					}
					Shared::notify_consumer(&state, ConsumerEvent::Closed);
					Some((previous, state.generation))
				}
			}
		};
		info!(target = "courier.push", "push channel closed by caller");
		if let Some((previous, current)) = closing {
			let shared = Arc::clone(&self.shared);
			drop(self.shared.runtime.spawn(async move {
				shared.close_sender(previous).await;
				let mut state = shared.state.lock();
				if state.generation == current && state.phase == PushChannelState::Closing {
					state.phase = PushChannelState::Closed;
					if state.wanted {
						debug!(target = "courier.push", "push channel reopen requested while closing");
						let _ = shared.events.send(SessionEvent::OpenPushChannel);
					}
				}
			}));
		}
	}

	/// Sends a frame on the open channel.
	pub async fn send(&self, frame: PushFrame) -> Result<()> {
		if self.state() != PushChannelState::Open {
			return Err(Error::TryAgainLater);
		}
		let mut slot = self.shared.sender.lock().await;
		match slot.as_mut() {
			Some((_, sender)) => sender.send(frame).await,
			None => Err(Error::TryAgainLater),
		}
	}

	/// Starts the handshake with `credential`; returns `false` when no attempt was made.
	pub(crate) fn begin_opening(&self, credential: Credential) -> bool {
		let Some(transport) = self.shared.transport.clone() else {
			return false;
		};
		let generation = {
			let mut state = self.shared.state.lock();
			if !state.wanted || state.phase != PushChannelState::Closed || !self.shared.reachability.is_reachable() {
				return false;
			}
			state.phase = PushChannelState::Opening;
			state.generation += 1;
			state.generation
		};
		debug!(target = "courier.push", generation, "opening push channel");
		let shared = Arc::clone(&self.shared);
		drop(self.shared.runtime.spawn(async move {
			match transport.connect(&credential).await {
				Ok(parts) => shared.connected(generation, parts).await,
				Err(Error::Unauthorized(reason)) => {
					warn!(target = "courier.push", %reason, "push handshake rejected");
					shared.credentials.on_request_rejected_as_unauthorized(Some(&credential));
					shared.connection_ended(generation, CloseCause::Unauthorized);
				}
				Err(err) => {
					warn!(target = "courier.push", error = %err, "push handshake failed");
					shared.connection_ended(generation, CloseCause::TransportError);
				}
			}
		}));
		true
	}

	pub(crate) fn on_reachability_changed(&self, reachability: ReachabilityState) {
		match reachability {
			ReachabilityState::Unreachable => {
				let previous = {
					let mut state = self.shared.state.lock();
					let was_open = match state.phase {
						PushChannelState::Open => true,
						PushChannelState::Opening => false,
						PushChannelState::Closed | PushChannelState::Closing => return,
					};
					let previous = state.generation;
					state.generation += 1;
					state.phase = PushChannelState::Closed;
					state.last_close = Some(CloseCause::ReachabilityLost);
					if let Some(reader) = state.reader.take() {
						reader.abort();
					}
					if was_open {
						Shared::notify_consumer(&state, ConsumerEvent::Closed);
					}
					previous
				};
				info!(target = "courier.push", "push channel closed: network unreachable");
				let shared = Arc::clone(&self.shared);
				drop(self.shared.runtime.spawn(async move { shared.close_sender(previous).await }));
			}
			ReachabilityState::Reachable | ReachabilityState::Unknown => {
				let state = self.shared.state.lock();
				if state.wanted && state.phase == PushChannelState::Closed {
					let _ = self.shared.events.send(SessionEvent::OpenPushChannel);
				}
			}
		}
	}

	/// Closes the channel and detaches the consumer.
	pub(crate) fn tear_down(&self) {
		self.close();
		self.shared.state.lock().consumer = None;
	}
}

impl Shared {
	fn notify_consumer(state: &PushState, event: ConsumerEvent) {
		if let Some(consumer) = state.consumer.as_ref() {
			let _ = consumer.send(event);
		}
	}

	async fn connected(self: Arc<Self>, generation: u64, parts: PushTransportParts) {
		let PushTransportParts { mut sender, receiver } = parts;
		let mut slot = self.sender.lock().await;
		let accepted = {
			let mut state = self.state.lock();
			if state.generation == generation && state.phase == PushChannelState::Opening {
				state.phase = PushChannelState::Open;
				state.reconnect.reset();
				Self::notify_consumer(&state, ConsumerEvent::Opened);
				true
			} else {
				false
			}
		};
		if !accepted {
			drop(slot);
			debug!(target = "courier.push", generation, "discarding superseded push connection");
			let _ = sender.close().await;
			return;
		}
		*slot = Some((generation, sender));
		drop(slot);
		info!(target = "courier.push", generation, "push channel open");

		let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
		let run = receiver.run(frames_tx);
		let shared = Arc::clone(&self);
		let reader = self.runtime.spawn(async move {
			let forward = async {
				while let Some(frame) = frames_rx.recv().await {
					let state = shared.state.lock();
					if state.generation != generation {
						break;
					}
					Self::notify_consumer(&state, ConsumerEvent::Frame(frame));
				}
			};
			let (result, ()) = tokio::join!(run, forward);
			match result {
				Ok(()) => debug!(target = "courier.push", generation, "push connection closed by server"),
				Err(err) => warn!(target = "courier.push", generation, error = %err, "push connection failed"),
			}
			shared.connection_ended(generation, CloseCause::TransportError);
		});

		let mut state = self.state.lock();
		if state.generation == generation {
			state.reader = Some(reader.abort_handle());
		} else {
			reader.abort();
		}
	}

	fn connection_ended(self: &Arc<Self>, generation: u64, cause: CloseCause) {
		let reopen = {
			let mut state = self.state.lock();
			if state.generation != generation {
				return;
			}
			let was_open = state.phase == PushChannelState::Open;
			state.phase = PushChannelState::Closed;
			state.last_close = Some(cause);
			state.reader = None;
			if was_open {
				Self::notify_consumer(&state, ConsumerEvent::Closed);
			}
			if !state.wanted {
				None
			} else {
				match cause {
					CloseCause::Unauthorized => Some(SessionEvent::OpenPushChannel),
					CloseCause::TransportError => Some(SessionEvent::OpenPushChannelAfter(state.reconnect.next_delay())),
					CloseCause::Explicit | CloseCause::ReachabilityLost => None,
				}
			}
		};
		info!(target = "courier.push", generation, ?cause, "push channel closed");
		let shared = Arc::clone(self);
		drop(self.runtime.spawn(async move { shared.close_sender(generation).await }));
		if let Some(event) = reopen {
			debug!(target = "courier.push", ?event, "scheduling push channel reopen");
			let _ = self.events.send(event);
		}
	}

	/// Closes the stored sender if it belongs to `generation`.
	async fn close_sender(&self, generation: u64) {
		let sender = {
			let mut slot = self.sender.lock().await;
			match slot.as_ref() {
				Some((owner, _)) if *owner == generation => slot.take().map(|(_, sender)| sender),
				_ => None,
			}
		};
		if let Some(mut sender) = sender {
			if let Err(err) = sender.close().await {
				debug!(target = "courier.push", error = %err, "push sender close failed");
			}
		}
	}
}
