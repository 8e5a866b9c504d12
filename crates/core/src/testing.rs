//! In-process doubles for exercising a session without a network.
//!
//! These mirror the real collaborators closely enough for scheduling tests:
//! dispatches can be held and released one by one, renewals can be gated,
//! and push connections can be fed frames or dropped from the "server" side.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use courier_protocol::{Credential, HttpResponse, Method, PushFrame};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, watch};

use crate::credential::CredentialRenewer;
use crate::error::{Error, Result};
use crate::push_channel::PushChannelConsumer;
use crate::request::{HttpRequest, RequestId};
use crate::transport::{PushReceiver, PushSender, PushTransport, PushTransportParts, Transport, TransportOutcome};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const UNGATED_PERMITS: usize = 1 << 20;

/// Waits until `counter` reaches `at_least`, failing after a few seconds.
async fn wait_for_count(counter: &watch::Sender<usize>, at_least: usize) -> Result<()> {
	let mut rx = counter.subscribe();
	tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|count| *count >= at_least))
		.await
		.map_err(|_| Error::Invalid(format!("timed out waiting for {at_least} events")))?
		.map(|_| ())
		.map_err(|_| Error::Invalid("counter dropped".to_string()))
}

/// One request as seen by [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
	pub id: RequestId,
	pub method: Method,
	pub path: String,
	pub credential: Option<Credential>,
}

struct FakeTransportInner {
	dispatched: Mutex<Vec<Dispatched>>,
	dispatch_count: watch::Sender<usize>,
	in_flight: AtomicUsize,
	peak: AtomicUsize,
	scripted: Mutex<VecDeque<TransportOutcome>>,
	fallback: Mutex<TransportOutcome>,
	gated: AtomicBool,
	permits: Semaphore,
}

/// Scripted [`Transport`] that records every dispatch.
///
/// Outcomes are taken from the script in completion order; once it runs dry
/// every request gets the fallback (200 with an empty JSON object).
#[derive(Clone)]
pub struct FakeTransport {
	inner: Arc<FakeTransportInner>,
}

impl Default for FakeTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl FakeTransport {
	/// Answers immediately.
	pub fn new() -> Self {
		Self::build(false)
	}

	/// Holds every dispatch until [`release`](Self::release) lets it through.
	pub fn gated() -> Self {
		Self::build(true)
	}

	fn build(gated: bool) -> Self {
		Self {
			inner: Arc::new(FakeTransportInner {
				dispatched: Mutex::new(Vec::new()),
				dispatch_count: watch::Sender::new(0),
				in_flight: AtomicUsize::new(0),
				peak: AtomicUsize::new(0),
				scripted: Mutex::new(VecDeque::new()),
				fallback: Mutex::new(TransportOutcome::Response(HttpResponse::json_body(200, &serde_json::json!({})))),
				gated: AtomicBool::new(gated),
				permits: Semaphore::new(0),
			}),
		}
	}

	/// Appends an outcome to the script.
	pub fn push_outcome(&self, outcome: TransportOutcome) {
		self.inner.scripted.lock().push_back(outcome);
	}

	pub fn push_status(&self, status: u16) {
		self.push_outcome(TransportOutcome::Response(HttpResponse::new(status, Vec::new())));
	}

	pub fn set_fallback(&self, outcome: TransportOutcome) {
		*self.inner.fallback.lock() = outcome;
	}

	/// Lets `count` held dispatches complete, oldest first.
	pub fn release(&self, count: usize) {
		self.inner.permits.add_permits(count);
	}

	/// Stops gating; held and future dispatches complete immediately.
	pub fn open(&self) {
		self.inner.gated.store(false, Ordering::SeqCst);
		self.inner.permits.add_permits(UNGATED_PERMITS);
	}

	pub fn dispatched(&self) -> Vec<Dispatched> {
		self.inner.dispatched.lock().clone()
	}

	pub fn dispatched_paths(&self) -> Vec<String> {
		self.inner.dispatched.lock().iter().map(|dispatched| dispatched.path.clone()).collect()
	}

	pub fn dispatch_count(&self) -> usize {
		*self.inner.dispatch_count.borrow()
	}

	pub fn in_flight(&self) -> usize {
		self.inner.in_flight.load(Ordering::SeqCst)
	}

	/// Highest number of dispatches that were outstanding at once.
	pub fn peak_concurrency(&self) -> usize {
		self.inner.peak.load(Ordering::SeqCst)
	}

	pub async fn wait_for_dispatches(&self, count: usize) -> Result<()> {
		wait_for_count(&self.inner.dispatch_count, count).await
	}
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

impl Transport for FakeTransport {
	fn dispatch<'a>(&'a self, request: &'a HttpRequest, credential: Option<&'a Credential>) -> BoxFuture<'a, TransportOutcome> {
		Box::pin(async move {
			let inner = &self.inner;
			let current = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			let _guard = InFlightGuard(&inner.in_flight);
			inner.peak.fetch_max(current, Ordering::SeqCst);
			inner.dispatched.lock().push(Dispatched {
				id: request.id(),
				method: request.method,
				path: request.path.clone(),
				credential: credential.cloned(),
			});
			inner.dispatch_count.send_modify(|count| *count += 1);

			if inner.gated.load(Ordering::SeqCst) {
				match inner.permits.acquire().await {
					Ok(permit) => permit.forget(),
					Err(_) => return TransportOutcome::Cancelled,
				}
			}
			let scripted = inner.scripted.lock().pop_front();
			scripted.unwrap_or_else(|| inner.fallback.lock().clone())
		})
	}
}

struct FakeRenewerInner {
	calls: watch::Sender<usize>,
	failing: AtomicBool,
	gated: AtomicBool,
	permits: Semaphore,
	issued_expiry: Mutex<Option<u64>>,
}

/// [`CredentialRenewer`] that issues `token-1`, `token-2`, ... and counts calls.
#[derive(Clone)]
pub struct FakeRenewer {
	inner: Arc<FakeRenewerInner>,
}

impl Default for FakeRenewer {
	fn default() -> Self {
		Self::new()
	}
}

impl FakeRenewer {
	pub fn new() -> Self {
		Self::build(false)
	}

	/// Holds every renewal until [`release`](Self::release).
	pub fn held() -> Self {
		Self::build(true)
	}

	fn build(gated: bool) -> Self {
		Self {
			inner: Arc::new(FakeRenewerInner {
				calls: watch::Sender::new(0),
				failing: AtomicBool::new(false),
				gated: AtomicBool::new(gated),
				permits: Semaphore::new(0),
				issued_expiry: Mutex::new(None),
			}),
		}
	}

	pub fn release(&self, count: usize) {
		self.inner.permits.add_permits(count);
	}

	pub fn set_failing(&self, failing: bool) {
		self.inner.failing.store(failing, Ordering::SeqCst);
	}

	/// Absolute expiry (unix seconds) stamped on issued credentials.
	pub fn set_issued_expiry(&self, expires_at: Option<u64>) {
		*self.inner.issued_expiry.lock() = expires_at;
	}

	pub fn calls(&self) -> usize {
		*self.inner.calls.borrow()
	}

	pub async fn wait_for_calls(&self, count: usize) -> Result<()> {
		wait_for_count(&self.inner.calls, count).await
	}
}

impl CredentialRenewer for FakeRenewer {
	fn renew<'a>(&'a self, _previous: Option<&'a Credential>) -> BoxFuture<'a, Result<Credential>> {
		Box::pin(async move {
			let inner = &self.inner;
			let mut call = 0;
			inner.calls.send_modify(|calls| {
				*calls += 1;
				call = *calls;
			});
			if inner.gated.load(Ordering::SeqCst) {
				inner.permits.acquire().await.map_err(|err| Error::Invalid(err.to_string()))?.forget();
			}
			if inner.failing.load(Ordering::SeqCst) {
				return Err(Error::Unauthorized("renewal rejected".to_string()));
			}
			let credential = Credential::bearer(format!("token-{call}"));
			Ok(match *inner.issued_expiry.lock() {
				Some(expires_at) => credential.with_expires_at(expires_at),
				None => credential,
			})
		})
	}
}

/// Server side of one fake push connection.
#[derive(Clone)]
pub struct FakePushConnection {
	inbound: mpsc::UnboundedSender<Result<PushFrame>>,
	sent: Arc<Mutex<Vec<PushFrame>>>,
	closed: Arc<AtomicBool>,
	credential: Credential,
}

impl FakePushConnection {
	/// Delivers a frame to the client.
	pub fn inject(&self, frame: PushFrame) -> bool {
		self.inbound.send(Ok(frame)).is_ok()
	}

	/// Breaks the connection with a transport error.
	pub fn fail(&self, reason: &str) -> bool {
		self.inbound.send(Err(Error::Network(reason.to_string()))).is_ok()
	}

	/// Frames the client sent.
	pub fn sent(&self) -> Vec<PushFrame> {
		self.sent.lock().clone()
	}

	/// Whether the client closed its sending half.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn credential(&self) -> &Credential {
		&self.credential
	}
}

struct FakePushInner {
	connects: watch::Sender<usize>,
	connections: Mutex<Vec<FakePushConnection>>,
	reject_unauthorized: AtomicUsize,
	fail_handshakes: AtomicUsize,
}

/// [`PushTransport`] whose connections are driven from the test.
#[derive(Clone)]
pub struct FakePushTransport {
	inner: Arc<FakePushInner>,
}

impl Default for FakePushTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl FakePushTransport {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(FakePushInner {
				connects: watch::Sender::new(0),
				connections: Mutex::new(Vec::new()),
				reject_unauthorized: AtomicUsize::new(0),
				fail_handshakes: AtomicUsize::new(0),
			}),
		}
	}

	/// The next `count` handshakes are rejected as unauthorized.
	pub fn reject_next_unauthorized(&self, count: usize) {
		self.inner.reject_unauthorized.store(count, Ordering::SeqCst);
	}

	/// The next `count` handshakes fail with a network error.
	pub fn fail_next(&self, count: usize) {
		self.inner.fail_handshakes.store(count, Ordering::SeqCst);
	}

	/// Handshake attempts, successful or not.
	pub fn connect_attempts(&self) -> usize {
		*self.inner.connects.borrow()
	}

	pub fn connections(&self) -> Vec<FakePushConnection> {
		self.inner.connections.lock().clone()
	}

	pub fn latest(&self) -> Option<FakePushConnection> {
		self.inner.connections.lock().last().cloned()
	}

	pub async fn wait_for_attempts(&self, count: usize) -> Result<()> {
		wait_for_count(&self.inner.connects, count).await
	}
}

fn take_one(counter: &AtomicUsize) -> bool {
	counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok()
}

impl PushTransport for FakePushTransport {
	fn connect<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<PushTransportParts>> {
		Box::pin(async move {
			let inner = &self.inner;
			let outcome = if take_one(&inner.reject_unauthorized) {
				Err(Error::Unauthorized("handshake rejected".to_string()))
			} else if take_one(&inner.fail_handshakes) {
				Err(Error::Network("handshake failed".to_string()))
			} else {
				let (inbound, frames) = mpsc::unbounded_channel();
				let connection = FakePushConnection {
					inbound,
					sent: Arc::new(Mutex::new(Vec::new())),
					closed: Arc::new(AtomicBool::new(false)),
					credential: credential.clone(),
				};
				let parts = PushTransportParts {
					sender: Box::new(FakePushSender {
						sent: Arc::clone(&connection.sent),
						closed: Arc::clone(&connection.closed),
					}),
					receiver: Box::new(FakePushReceiver { frames }),
				};
				inner.connections.lock().push(connection);
				Ok(parts)
			};
			inner.connects.send_modify(|count| *count += 1);
			outcome
		})
	}
}

struct FakePushSender {
	sent: Arc<Mutex<Vec<PushFrame>>>,
	closed: Arc<AtomicBool>,
}

impl PushSender for FakePushSender {
	fn send(&mut self, frame: PushFrame) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			if self.closed.load(Ordering::SeqCst) {
				return Err(Error::Network("connection closed".to_string()));
			}
			self.sent.lock().push(frame);
			Ok(())
		})
	}

	fn close(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			self.closed.store(true, Ordering::SeqCst);
			Ok(())
		})
	}
}

struct FakePushReceiver {
	frames: mpsc::UnboundedReceiver<Result<PushFrame>>,
}

impl PushReceiver for FakePushReceiver {
	fn run(self: Box<Self>, out: mpsc::UnboundedSender<PushFrame>) -> BoxFuture<'static, Result<()>> {
		let mut frames = self.frames;
		Box::pin(async move {
			while let Some(frame) = frames.recv().await {
				if out.send(frame?).is_err() {
					break;
				}
			}
			Ok(())
		})
	}
}

/// Consumer that records everything it is told.
pub struct RecordingConsumer {
	frames: Mutex<Vec<PushFrame>>,
	events: watch::Sender<usize>,
	opened: AtomicUsize,
	closed: AtomicUsize,
}

impl RecordingConsumer {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			frames: Mutex::new(Vec::new()),
			events: watch::Sender::new(0),
			opened: AtomicUsize::new(0),
			closed: AtomicUsize::new(0),
		})
	}

	pub fn frames(&self) -> Vec<PushFrame> {
		self.frames.lock().clone()
	}

	pub fn opened(&self) -> usize {
		self.opened.load(Ordering::SeqCst)
	}

	pub fn closed(&self) -> usize {
		self.closed.load(Ordering::SeqCst)
	}

	/// Waits until `count` callbacks of any kind have arrived.
	pub async fn wait_for_events(&self, count: usize) -> Result<()> {
		wait_for_count(&self.events, count).await
	}

	fn bump(&self) {
		self.events.send_modify(|count| *count += 1);
	}
}

impl PushChannelConsumer for RecordingConsumer {
	fn push_channel_did_receive(&self, frame: PushFrame) {
		self.frames.lock().push(frame);
		self.bump();
	}

	fn push_channel_did_open(&self) {
		self.opened.fetch_add(1, Ordering::SeqCst);
		self.bump();
	}

	fn push_channel_did_close(&self) {
		self.closed.fetch_add(1, Ordering::SeqCst);
		self.bump();
	}
}
