//! Work items accepted by the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use courier_protocol::{ConcurrencyGroup, HttpResponse, Method, Priority};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of a request, assigned at construction.
///
/// Known before the request is enqueued, so generator-produced requests can be
/// cancelled too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
	fn next() -> Self {
		Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
	}

	pub fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

pub(crate) type Responder = oneshot::Sender<Result<HttpResponse>>;

/// An HTTP request plus the channel its outcome is delivered on.
#[derive(Debug)]
pub struct HttpRequest {
	id: RequestId,
	pub method: Method,
	pub path: String,
	/// JSON body; opaque to the scheduler.
	pub body: Option<Value>,
	pub priority: Priority,
	pub group: ConcurrencyGroup,
	/// Dispatch deadline; past it the request fails with `RequestExpired`.
	pub deadline: Option<Instant>,
	/// Whether a credential must be attached.
	pub requires_auth: bool,
	responder: Option<Responder>,
}

impl HttpRequest {
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			id: RequestId::next(),
			method,
			path: path.into(),
			body: None,
			priority: Priority::default(),
			group: ConcurrencyGroup::default(),
			deadline: None,
			requires_auth: true,
			responder: None,
		}
	}

	pub fn get(path: impl Into<String>) -> Self {
		Self::new(Method::Get, path)
	}

	pub fn post(path: impl Into<String>, body: Value) -> Self {
		Self::new(Method::Post, path).with_body(body)
	}

	pub fn id(&self) -> RequestId {
		self.id
	}

	pub fn with_body(mut self, body: Value) -> Self {
		self.body = Some(body);
		self
	}

	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	pub fn with_group(mut self, group: ConcurrencyGroup) -> Self {
		self.group = group;
		self
	}

	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(deadline);
		self
	}

	/// Sets the deadline relative to now.
	pub fn expires_after(self, timeout: Duration) -> Self {
		self.with_deadline(Instant::now() + timeout)
	}

	/// Sends the request without a credential (login, renewal).
	pub fn without_auth(mut self) -> Self {
		self.requires_auth = false;
		self
	}

	/// Attaches a completion channel and returns its receiving end.
	///
	/// Calling it again replaces the previous channel; the old receiver then
	/// resolves with [`Error::Invalid`].
	pub fn completion(&mut self) -> Completion {
		let (tx, rx) = oneshot::channel();
		self.responder = Some(tx);
		Completion { id: self.id, rx }
	}

	pub(crate) fn is_expired_at(&self, now: Instant) -> bool {
		self.deadline.is_some_and(|deadline| deadline <= now)
	}

	pub(crate) fn take_responder(&mut self) -> Option<Responder> {
		self.responder.take()
	}

	/// Delivers the outcome, consuming the request.
	pub(crate) fn respond(mut self, result: Result<HttpResponse>) {
		respond(self.take_responder(), result);
	}
}

pub(crate) fn respond(responder: Option<Responder>, result: Result<HttpResponse>) {
	if let Some(tx) = responder {
		let _ = tx.send(result);
	}
}

/// Receiving end of a request's outcome.
#[derive(Debug)]
pub struct Completion {
	id: RequestId,
	rx: oneshot::Receiver<Result<HttpResponse>>,
}

impl Completion {
	pub fn id(&self) -> RequestId {
		self.id
	}

	/// Waits for the outcome.
	pub async fn wait(self) -> Result<HttpResponse> {
		self.rx
			.await
			.map_err(|_| Error::Invalid(format!("request {} dropped without an outcome", self.id)))?
	}

	/// Returns the outcome if it has already been delivered.
	pub fn try_take(&mut self) -> Option<Result<HttpResponse>> {
		match self.rx.try_recv() {
			Ok(result) => Some(result),
			Err(oneshot::error::TryRecvError::Empty) => None,
			Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Invalid(format!("request {} dropped without an outcome", self.id)))),
		}
	}
}

/// Unit of work handed to the scheduler.
#[derive(Debug)]
pub enum WorkItem {
	Http(HttpRequest),
	/// Open the push channel once reachable and authenticated.
	OpenPushChannel,
}

impl From<HttpRequest> for WorkItem {
	fn from(request: HttpRequest) -> Self {
		Self::Http(request)
	}
}

/// Pull callback asked for work whenever a slot frees up.
///
/// Returning `None` means "nothing to send right now"; it consumes no slot.
pub trait RequestGenerator: Send + Sync {
	fn next_request(&self) -> Option<HttpRequest>;
}

impl<F> RequestGenerator for F
where
	F: Fn() -> Option<HttpRequest> + Send + Sync,
{
	fn next_request(&self) -> Option<HttpRequest> {
		self()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_unique_and_increasing() {
		let a = HttpRequest::get("/a");
		let b = HttpRequest::get("/b");
		assert!(b.id() > a.id());
	}

	#[test]
	fn defaults_require_auth_on_foreground() {
		let request = HttpRequest::get("/conversations");
		assert!(request.requires_auth);
		assert_eq!(request.group, ConcurrencyGroup::Foreground);
		assert_eq!(request.priority, Priority::Normal);
		assert!(request.deadline.is_none());
	}

	#[test]
	fn expiry_is_checked_against_deadline() {
		let now = Instant::now();
		let request = HttpRequest::get("/a").with_deadline(now);
		assert!(request.is_expired_at(now));
		assert!(!HttpRequest::get("/b").is_expired_at(now));
	}

	#[tokio::test]
	async fn completion_receives_response() {
		let mut request = HttpRequest::get("/a");
		let completion = request.completion();
		request.respond(Ok(HttpResponse::new(200, b"ok".to_vec())));
		let response = completion.wait().await.unwrap();
		assert_eq!(response.status, 200);
	}

	#[tokio::test]
	async fn dropped_request_resolves_invalid() {
		let mut request = HttpRequest::get("/a");
		let completion = request.completion();
		drop(request);
		assert!(matches!(completion.wait().await, Err(Error::Invalid(_))));
	}
}
