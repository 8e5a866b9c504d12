//! Request scheduler: admission under a concurrency budget.
//!
//! Slot accounting, the pending queues, the generator registry and the active
//! request table share one lock, so reserving a slot and recording what it is
//! used for is a single step. Generators, transports and user callbacks are
//! never invoked while the lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use courier_protocol::{Credential, EnqueueResult, Method, Priority, ReachabilityState, SessionErrorCode};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::credential::{CredentialHandler, EnsureValid};
use crate::error::Error;
use crate::events::SessionEvent;
use crate::loop_detection::RequestLoopDetector;
use crate::push_channel::PushChannel;
use crate::reachability::ReachabilityObserver;
use crate::request::{HttpRequest, RequestGenerator, RequestId, Responder, WorkItem, respond};
use crate::transport::{Transport, TransportOutcome};

/// Handle returned by [`Session::register_generator`](crate::Session::register_generator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneratorId(u64);

/// What admission did with a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	/// Handed to the transport.
	Dispatched,
	/// Waiting for a free slot (or, for the push channel, for its preconditions).
	Queued,
	/// Held until the running credential renewal finishes; uses no slot.
	AwaitingCredential,
	/// The generator had nothing to send.
	NoRequest,
	/// No slot was free, or a credential renewal is pending; the generator was not asked.
	NoCapacity,
	/// Failed immediately; the completion received the matching error.
	Rejected(SessionErrorCode),
}

type LoopCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ActiveRequest {
	responder: Option<Responder>,
	abort: AbortHandle,
	credential: Option<Credential>,
	method: Method,
	path: String,
}

struct SchedulerState {
	max_concurrent: usize,
	/// Occupied slots: active requests plus reservations held during a generator call.
	in_flight: usize,
	active: HashMap<RequestId, ActiveRequest>,
	/// Ready to dispatch, indexed by [`Priority::index`].
	pending: [VecDeque<HttpRequest>; 3],
	awaiting_credential: VecDeque<HttpRequest>,
	push_open_pending: bool,
	generators: Vec<(GeneratorId, Arc<dyn RequestGenerator>)>,
	next_generator_id: u64,
	generator_cursor: usize,
	backoff: Backoff,
	hold_off_until: Option<Instant>,
	loop_detector: RequestLoopDetector,
	loop_callback: Option<LoopCallback>,
	torn_down: bool,
}

impl SchedulerState {
	fn has_free_slot(&self) -> bool {
		self.in_flight < self.max_concurrent
	}

	fn has_pending(&self) -> bool {
		self.pending.iter().any(|queue| !queue.is_empty())
	}

	fn pop_pending(&mut self) -> Option<HttpRequest> {
		Priority::DESCENDING.iter().find_map(|priority| self.pending[priority.index()].pop_front())
	}

	fn remove_queued(&mut self, id: RequestId) -> Option<HttpRequest> {
		for queue in self.pending.iter_mut().chain(std::iter::once(&mut self.awaiting_credential)) {
			if let Some(position) = queue.iter().position(|request| request.id() == id) {
				return queue.remove(position);
			}
		}
		None
	}

	fn release_slot(&mut self) {
		self.in_flight = self.in_flight.saturating_sub(1);
	}

	/// Round-robin over generators not yet exhausted in this pass.
	fn next_generator(&mut self, exhausted: &HashSet<GeneratorId>) -> Option<(GeneratorId, Arc<dyn RequestGenerator>)> {
		let count = self.generators.len();
		(0..count)
			.map(|offset| (self.generator_cursor + offset) % count)
			.find(|index| !exhausted.contains(&self.generators[*index].0))
			.map(|index| {
				self.generator_cursor = index + 1;
				let (id, generator) = &self.generators[index];
				(*id, Arc::clone(generator))
			})
	}
}

struct Shared {
	state: Mutex<SchedulerState>,
	credentials: CredentialHandler,
	reachability: Arc<ReachabilityObserver>,
	push: PushChannel,
	transport: Arc<dyn Transport>,
	events: mpsc::UnboundedSender<SessionEvent>,
	runtime: Handle,
}

/// Admits work items and keeps at most `max_concurrent` of them dispatched.
#[derive(Clone)]
pub(crate) struct RequestScheduler {
	shared: Arc<Shared>,
}

impl RequestScheduler {
	pub(crate) fn new(
		config: &SessionConfig,
		transport: Arc<dyn Transport>,
		credentials: CredentialHandler,
		reachability: Arc<ReachabilityObserver>,
		push: PushChannel,
		events: mpsc::UnboundedSender<SessionEvent>,
		runtime: Handle,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(SchedulerState {
					max_concurrent: config.max_concurrent,
					in_flight: 0,
					active: HashMap::new(),
					pending: Default::default(),
					awaiting_credential: VecDeque::new(),
					push_open_pending: false,
					generators: Vec::new(),
					next_generator_id: 0,
					generator_cursor: 0,
					backoff: config.server_backoff.backoff(),
					hold_off_until: None,
					loop_detector: RequestLoopDetector::new(config.loop_detection),
					loop_callback: None,
					torn_down: false,
				}),
				credentials,
				reachability,
				push,
				transport,
				events,
				runtime,
			}),
		}
	}

	/// Accepts a work item, dispatching it immediately when a slot is free.
	pub(crate) fn enqueue(&self, item: WorkItem) -> Admission {
		let request = match item {
			WorkItem::OpenPushChannel => {
				self.shared.state.lock().push_open_pending = true;
				self.service_push_open();
				return Admission::Queued;
			}
			WorkItem::Http(request) => request,
		};

		let now = Instant::now();
		let mut state = self.shared.state.lock();
		if let Some(code) = self.refusal(&state, now) {
			drop(state);
			debug!(target = "courier.scheduler", request_id = %request.id(), ?code, "request refused");
			request.respond(Err(refusal_error(code)));
			return Admission::Rejected(code);
		}
		if request.is_expired_at(now) {
			drop(state);
			debug!(target = "courier.scheduler", request_id = %request.id(), "request expired before admission");
			request.respond(Err(Error::RequestExpired));
			return Admission::Rejected(SessionErrorCode::RequestExpired);
		}
		if state.has_pending() || !state.has_free_slot() {
			trace!(target = "courier.scheduler", request_id = %request.id(), in_flight = state.in_flight, "request queued");
			let free = state.has_free_slot();
			state.pending[request.priority.index()].push_back(request);
			drop(state);
			if free {
				self.process();
			}
			return Admission::Queued;
		}
		state.in_flight += 1;
		self.place(&mut state, request, now)
	}

	/// Offers one slot to `generator` if the session can take work right now.
	pub(crate) fn attempt(&self, generator: impl FnOnce() -> Option<HttpRequest>) -> (EnqueueResult, Admission) {
		let mut state = self.shared.state.lock();
		if let Some(code) = self.refusal(&state, Instant::now()) {
			return (EnqueueResult::no_capacity(), Admission::Rejected(code));
		}
		if state.has_pending() && state.has_free_slot() {
			drop(state);
			self.process();
			state = self.shared.state.lock();
		}
		if state.has_pending() || !state.has_free_slot() || !self.credential_settled() {
			return (EnqueueResult::no_capacity(), Admission::NoCapacity);
		}
		state.in_flight += 1;
		drop(state);

		let Some(request) = generator() else {
			let mut state = self.shared.state.lock();
			state.release_slot();
			return (EnqueueResult::new(true, false), Admission::NoRequest);
		};
		let mut state = self.shared.state.lock();
		let admission = self.place(&mut state, request, Instant::now());
		(EnqueueResult::new(true, true), admission)
	}

	pub(crate) fn register_generator(&self, generator: Arc<dyn RequestGenerator>) -> GeneratorId {
		let mut state = self.shared.state.lock();
		state.next_generator_id += 1;
		let id = GeneratorId(state.next_generator_id);
		state.generators.push((id, generator));
		debug!(target = "courier.scheduler", generators = state.generators.len(), "generator registered");
		id
	}

	pub(crate) fn unregister_generator(&self, id: GeneratorId) -> bool {
		let mut state = self.shared.state.lock();
		let before = state.generators.len();
		state.generators.retain(|(existing, _)| *existing != id);
		state.generators.len() != before
	}

	/// Fills free slots from the pending queues, then from generators.
	pub(crate) fn process(&self) {
		self.service_push_open();

		let mut exhausted = HashSet::new();
		loop {
			let (id, generator) = {
				let now = Instant::now();
				let mut state = self.shared.state.lock();
				if self.refusal(&state, now).is_some() || !state.has_free_slot() {
					return;
				}
				if let Some(request) = state.pop_pending() {
					state.in_flight += 1;
					let _ = self.place(&mut state, request, now);
					continue;
				}
				if !self.credential_settled() {
					trace!(target = "courier.scheduler", "generators paused until the credential settles");
					return;
				}
				let Some(next) = state.next_generator(&exhausted) else {
					return;
				};
				state.in_flight += 1;
				next
			};

			match generator.next_request() {
				Some(request) => {
					let mut state = self.shared.state.lock();
					let _ = self.place(&mut state, request, Instant::now());
				}
				None => {
					self.shared.state.lock().release_slot();
					let _ = exhausted.insert(id);
				}
			}
		}
	}

	/// Cancels a queued or in-flight request; returns `false` if it is unknown or finished.
	pub(crate) fn cancel(&self, id: RequestId) -> bool {
		let (responder, freed) = {
			let mut state = self.shared.state.lock();
			if let Some(active) = state.active.remove(&id) {
				state.release_slot();
				active.abort.abort();
				(active.responder, true)
			} else if let Some(mut request) = state.remove_queued(id) {
				(request.take_responder(), false)
			} else {
				return false;
			}
		};
		info!(target = "courier.scheduler", request_id = %id, in_flight = freed, "request cancelled");
		respond(responder, Err(Error::Cancelled));
		if freed {
			let _ = self.shared.events.send(SessionEvent::ProcessRequests);
		}
		true
	}

	/// Changes the budget; dispatched work is never preempted.
	pub(crate) fn set_max_concurrent(&self, max_concurrent: usize) {
		let mut state = self.shared.state.lock();
		debug!(target = "courier.scheduler", from = state.max_concurrent, to = max_concurrent, "concurrency budget changed");
		state.max_concurrent = max_concurrent;
	}

	pub(crate) fn max_concurrent(&self) -> usize {
		self.shared.state.lock().max_concurrent
	}

	pub(crate) fn in_flight(&self) -> usize {
		self.shared.state.lock().in_flight
	}

	pub(crate) fn pending_count(&self) -> usize {
		let state = self.shared.state.lock();
		state.pending.iter().map(VecDeque::len).sum()
	}

	pub(crate) fn awaiting_credential_count(&self) -> usize {
		self.shared.state.lock().awaiting_credential.len()
	}

	pub(crate) fn set_loop_callback(&self, callback: Option<LoopCallback>) {
		self.shared.state.lock().loop_callback = callback;
	}

	/// Queued requests fail with `TryAgainLater` once the network is gone.
	pub(crate) fn on_reachability_changed(&self, reachability: ReachabilityState) {
		if reachability != ReachabilityState::Unreachable {
			return;
		}
		let drained: Vec<HttpRequest> = {
			let mut state = self.shared.state.lock();
			state.pending.iter_mut().flat_map(|queue| queue.drain(..)).collect()
		};
		if !drained.is_empty() {
			info!(target = "courier.scheduler", count = drained.len(), "network unreachable; failing queued requests");
		}
		for request in drained {
			request.respond(Err(Error::TryAgainLater));
		}
	}

	/// Requests held for the credential go to the front of their queues, in order.
	pub(crate) fn on_credential_renewed(&self) {
		{
			let mut state = self.shared.state.lock();
			let held: Vec<HttpRequest> = state.awaiting_credential.drain(..).collect();
			if !held.is_empty() {
				debug!(target = "courier.scheduler", count = held.len(), "replaying requests held for credential");
			}
			for request in held.into_iter().rev() {
				state.pending[request.priority.index()].push_front(request);
			}
		}
		self.process();
	}

	pub(crate) fn on_credential_failed(&self) {
		let held: Vec<HttpRequest> = self.shared.state.lock().awaiting_credential.drain(..).collect();
		if !held.is_empty() {
			warn!(target = "courier.scheduler", count = held.len(), "credential renewal failed; failing held requests");
		}
		for request in held {
			request.respond(Err(Error::AuthenticationFailed));
		}
	}

	/// Cancels every queued and in-flight request and refuses further work.
	pub(crate) fn tear_down(&self) {
		let (queued, active) = {
			let mut state = self.shared.state.lock();
			state.torn_down = true;
			state.generators.clear();
			state.push_open_pending = false;
			state.in_flight = 0;
			let mut queued: Vec<HttpRequest> = state.pending.iter_mut().flat_map(|queue| queue.drain(..)).collect();
			queued.extend(state.awaiting_credential.drain(..));
			let active: Vec<ActiveRequest> = state.active.drain().map(|(_, active)| active).collect();
			(queued, active)
		};
		info!(target = "courier.scheduler", queued = queued.len(), active = active.len(), "scheduler torn down");
		for request in queued {
			request.respond(Err(Error::Cancelled));
		}
		for active in active {
			active.abort.abort();
			respond(active.responder, Err(Error::Cancelled));
		}
	}

	/// Generators are only asked while no renewal is running or has failed.
	fn credential_settled(&self) -> bool {
		let credentials = &self.shared.credentials;
		!credentials.is_renewing() && !credentials.renewal_failed()
	}

	fn refusal(&self, state: &SchedulerState, now: Instant) -> Option<SessionErrorCode> {
		if state.torn_down {
			return Some(SessionErrorCode::Invalid);
		}
		if !self.shared.reachability.is_reachable() {
			return Some(SessionErrorCode::TryAgainLater);
		}
		if state.hold_off_until.is_some_and(|until| now < until) {
			return Some(SessionErrorCode::TryAgainLater);
		}
		None
	}

	/// Decides the fate of a request that holds a reserved slot.
	fn place(&self, state: &mut SchedulerState, request: HttpRequest, now: Instant) -> Admission {
		if request.is_expired_at(now) {
			state.release_slot();
			debug!(target = "courier.scheduler", request_id = %request.id(), "request expired before dispatch");
			request.respond(Err(Error::RequestExpired));
			return Admission::Rejected(SessionErrorCode::RequestExpired);
		}
		let credential = if request.requires_auth {
			match self.shared.credentials.ensure_valid() {
				EnsureValid::AlreadyValid(credential) => Some(credential),
				EnsureValid::RenewalStarted => {
					state.release_slot();
					debug!(target = "courier.scheduler", request_id = %request.id(), "request held for credential renewal");
					state.awaiting_credential.push_back(request);
					return Admission::AwaitingCredential;
				}
				EnsureValid::RenewalFailed => {
					state.release_slot();
					request.respond(Err(Error::AuthenticationFailed));
					return Admission::Rejected(SessionErrorCode::AuthenticationFailed);
				}
			}
		} else {
			None
		};
		self.dispatch(state, request, credential, now);
		Admission::Dispatched
	}

	fn dispatch(&self, state: &mut SchedulerState, mut request: HttpRequest, credential: Option<Credential>, now: Instant) {
		let id = request.id();
		let responder = request.take_responder();
		let method = request.method;
		let path = request.path.clone();
		debug!(target = "courier.scheduler", request_id = %id, %method, %path, group = ?request.group, in_flight = state.in_flight, "dispatching request");

		if state.loop_detector.record(method, &path, now) {
			warn!(target = "courier.scheduler", %method, %path, "request loop detected");
			if let Some(callback) = state.loop_callback.clone() {
				let path = path.clone();
				drop(self.shared.runtime.spawn(async move { callback(&path) }));
			}
		}

		let shared = Arc::clone(&self.shared);
		let attached = credential.clone();
		let task = self.shared.runtime.spawn(async move {
			let outcome = shared.transport.dispatch(&request, attached.as_ref()).await;
			RequestScheduler { shared }.on_dispatch_completed(id, outcome);
		});
		let _ = state.active.insert(
			id,
			ActiveRequest {
				responder,
				abort: task.abort_handle(),
				credential,
				method,
				path,
			},
		);
	}

	/// Interprets a transport outcome and delivers it; outcomes for cancelled requests are dropped.
	pub(crate) fn on_dispatch_completed(&self, id: RequestId, outcome: TransportOutcome) {
		let (active, hold_off) = {
			let mut state = self.shared.state.lock();
			let Some(active) = state.active.remove(&id) else {
				trace!(target = "courier.scheduler", request_id = %id, "completion after cancellation ignored");
				return;
			};
			state.release_slot();
			let hold_off = match &outcome {
				TransportOutcome::Response(response) if response.is_backoff() => {
					let delay = state.backoff.next_delay();
					state.hold_off_until = Some(Instant::now() + delay);
					Some(delay)
				}
				TransportOutcome::Response(_) => {
					state.backoff.reset();
					state.hold_off_until = None;
					None
				}
				TransportOutcome::NetworkError(_) | TransportOutcome::Cancelled => None,
			};
			(active, hold_off)
		};

		let received_data = matches!(outcome, TransportOutcome::Response(_));
		let ActiveRequest {
			responder,
			credential,
			method,
			path,
			..
		} = active;
		let result = match outcome {
			TransportOutcome::Response(response) if response.is_unauthorized() && credential.is_some() => {
				info!(target = "courier.scheduler", request_id = %id, %method, %path, "request rejected as unauthorized");
				self.shared.credentials.on_request_rejected_as_unauthorized(credential.as_ref());
				Err(Error::TryAgainLater)
			}
			TransportOutcome::Response(response) if response.is_backoff() => {
				warn!(target = "courier.scheduler", request_id = %id, status = response.status, delay = ?hold_off, "server asked to back off");
				Err(Error::TryAgainLater)
			}
			TransportOutcome::Response(response) => {
				debug!(target = "courier.scheduler", request_id = %id, status = response.status, "request completed");
				Ok(response)
			}
			TransportOutcome::NetworkError(cause) => {
				warn!(target = "courier.scheduler", request_id = %id, %method, %path, error = %cause, "request failed");
				Err(Error::Network(cause))
			}
			TransportOutcome::Cancelled => Err(Error::Cancelled),
		};
		respond(responder, result);

		let _ = self.shared.events.send(SessionEvent::RequestFinished { received_data });
		if let Some(delay) = hold_off {
			let _ = self.shared.events.send(SessionEvent::ProcessRequestsAfter(delay));
		}
	}

	/// Opens the push channel when it is wanted, reachable and authenticated.
	fn service_push_open(&self) {
		let credential = {
			let mut state = self.shared.state.lock();
			if !state.push_open_pending || state.torn_down {
				return;
			}
			if !self.shared.push.wants_open() {
				state.push_open_pending = false;
				return;
			}
			if !self.shared.reachability.is_reachable() {
				return;
			}
			match self.shared.credentials.ensure_valid() {
				EnsureValid::AlreadyValid(credential) => {
					state.push_open_pending = false;
					credential
				}
				EnsureValid::RenewalStarted | EnsureValid::RenewalFailed => return,
			}
		};
		let _ = self.shared.push.begin_opening(credential);
	}
}

fn refusal_error(code: SessionErrorCode) -> Error {
	match code {
		SessionErrorCode::Invalid => Error::Invalid("session has been torn down".to_string()),
		other => Error::from_code(other),
	}
}

#[cfg(test)]
mod tests {
	use courier_protocol::Priority;

	use super::*;
	use crate::config::LoopDetectionConfig;

	fn state() -> SchedulerState {
		SchedulerState {
			max_concurrent: 2,
			in_flight: 0,
			active: HashMap::new(),
			pending: Default::default(),
			awaiting_credential: VecDeque::new(),
			push_open_pending: false,
			generators: Vec::new(),
			next_generator_id: 0,
			generator_cursor: 0,
			backoff: Backoff::default(),
			hold_off_until: None,
			loop_detector: RequestLoopDetector::new(LoopDetectionConfig::default()),
			loop_callback: None,
			torn_down: false,
		}
	}

	fn idle() -> Arc<dyn RequestGenerator> {
		Arc::new(|| -> Option<HttpRequest> { None })
	}

	#[test]
	fn pending_requests_leave_by_priority_then_arrival() {
		let mut state = state();
		for (path, priority) in [("/a", Priority::Low), ("/b", Priority::Normal), ("/c", Priority::High), ("/d", Priority::Normal)] {
			let request = HttpRequest::get(path).with_priority(priority);
			state.pending[priority.index()].push_back(request);
		}
		let order: Vec<String> = std::iter::from_fn(|| state.pop_pending()).map(|request| request.path).collect();
		assert_eq!(order, vec!["/c", "/b", "/d", "/a"]);
	}

	#[test]
	fn generators_rotate_and_skip_exhausted_ones() {
		let mut state = state();
		for id in 1..=3 {
			state.generators.push((GeneratorId(id), idle()));
		}
		let mut exhausted = HashSet::new();
		assert_eq!(state.next_generator(&exhausted).map(|(id, _)| id), Some(GeneratorId(1)));
		assert_eq!(state.next_generator(&exhausted).map(|(id, _)| id), Some(GeneratorId(2)));

		let _ = exhausted.insert(GeneratorId(3));
		assert_eq!(state.next_generator(&exhausted).map(|(id, _)| id), Some(GeneratorId(1)));

		let _ = exhausted.insert(GeneratorId(1));
		let _ = exhausted.insert(GeneratorId(2));
		assert!(state.next_generator(&exhausted).is_none());
	}

	#[test]
	fn queued_requests_can_be_removed_from_any_queue() {
		let mut state = state();
		let pending = HttpRequest::get("/pending");
		let held = HttpRequest::get("/held");
		let (pending_id, held_id) = (pending.id(), held.id());
		state.pending[Priority::Normal.index()].push_back(pending);
		state.awaiting_credential.push_back(held);

		assert_eq!(state.remove_queued(held_id).map(|request| request.path), Some("/held".to_string()));
		assert_eq!(state.remove_queued(pending_id).map(|request| request.path), Some("/pending".to_string()));
		assert!(state.remove_queued(pending_id).is_none());
		assert!(!state.has_pending());
	}

	#[test]
	fn slot_release_never_underflows() {
		let mut state = state();
		state.release_slot();
		assert_eq!(state.in_flight, 0);
		state.in_flight = 2;
		assert!(!state.has_free_slot());
		state.release_slot();
		assert!(state.has_free_slot());
	}
}
