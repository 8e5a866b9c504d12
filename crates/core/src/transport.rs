//! Transport boundary: what the session needs from HTTP and push connections.
//!
//! The session never speaks a wire protocol itself. It hands requests to a
//! [`Transport`] and opens push connections through a [`PushTransport`], which
//! splits each connection into a [`PushSender`] and a [`PushReceiver`] so the
//! read loop can run in its own task while sends stay available.

use courier_protocol::{BackgroundTask, Credential, HttpResponse, PushFrame};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::request::HttpRequest;

/// Result of handing one request to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
	/// The server answered; any status, including errors.
	Response(HttpResponse),
	/// The request never produced an HTTP response.
	NetworkError(String),
	/// The transport aborted the request.
	Cancelled,
}

/// Dispatches HTTP requests.
///
/// Implementations must be cancel-safe: the session aborts the dispatch future
/// when the caller cancels an in-flight request.
pub trait Transport: Send + Sync {
	/// Sends `request`, attaching `credential` when present.
	fn dispatch<'a>(&'a self, request: &'a HttpRequest, credential: Option<&'a Credential>) -> BoxFuture<'a, TransportOutcome>;

	/// Enumerates transfers currently tracked by the background session.
	fn background_tasks(&self) -> BoxFuture<'_, Vec<BackgroundTask>> {
		Box::pin(async { Vec::new() })
	}
}

/// Opens push connections.
pub trait PushTransport: Send + Sync {
	/// Performs the handshake.
	///
	/// A server-side credential rejection must be reported as
	/// [`Error::Unauthorized`](crate::Error::Unauthorized) so the session can renew.
	fn connect<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<PushTransportParts>>;
}

/// Sending half of a push connection.
pub trait PushSender: Send {
	fn send(&mut self, frame: PushFrame) -> BoxFuture<'_, Result<()>>;

	/// Closes the connection gracefully.
	fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Receiving half of a push connection.
pub trait PushReceiver: Send {
	/// Forwards inbound frames to `frames` until the connection ends.
	///
	/// Returns `Ok(())` on an orderly close and an error when the transport failed.
	fn run(self: Box<Self>, frames: mpsc::UnboundedSender<PushFrame>) -> BoxFuture<'static, Result<()>>;
}

/// Both halves of an established push connection.
pub struct PushTransportParts {
	pub sender: Box<dyn PushSender>,
	pub receiver: Box<dyn PushReceiver>,
}
