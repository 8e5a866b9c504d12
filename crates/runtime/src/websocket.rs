//! Push transport over a WebSocket connection.

use courier::{Error, PushReceiver, PushSender, PushTransport, PushTransportParts, Result};
use courier_protocol::{Credential, PushFrame};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens push connections to a fixed WebSocket URL.
#[derive(Debug, Clone)]
pub struct WebSocketPushTransport {
	url: String,
}

impl WebSocketPushTransport {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	async fn open(&self, credential: &Credential) -> Result<PushTransportParts> {
		let mut request = self
			.url
			.as_str()
			.into_client_request()
			.map_err(|err| Error::Invalid(format!("bad push URL {:?}: {err}", self.url)))?;
		let authorization = HeaderValue::from_str(&credential.authorization())
			.map_err(|err| Error::Invalid(format!("invalid credential header: {err}")))?;
		let _ = request.headers_mut().insert(AUTHORIZATION, authorization);

		let (ws, _response) = connect_async(request).await.map_err(|err| handshake_error(&self.url, err))?;
		info!(target = "courier.ws", url = %self.url, "push connection established");

		let (sink, stream) = ws.split();
		Ok(PushTransportParts {
			sender: Box::new(WebSocketSender { sink }),
			receiver: Box::new(WebSocketReceiver { stream }),
		})
	}
}

impl PushTransport for WebSocketPushTransport {
	fn connect<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<PushTransportParts>> {
		Box::pin(self.open(credential))
	}
}

fn handshake_error(url: &str, err: tungstenite::Error) -> Error {
	match err {
		tungstenite::Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
			warn!(target = "courier.ws", url, "push handshake rejected the credential");
			Error::Unauthorized(format!("push handshake to {url} returned 401"))
		}
		tungstenite::Error::Http(response) => Error::Network(format!("push handshake to {url} returned {}", response.status())),
		other => Error::Network(format!("push connect to {url} failed: {other}")),
	}
}

struct WebSocketSender {
	sink: SplitSink<WsStream, Message>,
}

impl PushSender for WebSocketSender {
	fn send(&mut self, frame: PushFrame) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let message = match frame {
				PushFrame::Json(value) => Message::Text(value.to_string()),
				PushFrame::Binary(bytes) => Message::Binary(bytes),
			};
			self.sink
				.send(message)
				.await
				.map_err(|err| Error::Network(format!("push send failed: {err}")))
		})
	}

	fn close(&mut self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			match self.sink.close().await {
				Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
				Err(err) => Err(Error::Network(format!("push close failed: {err}"))),
			}
		})
	}
}

struct WebSocketReceiver {
	stream: SplitStream<WsStream>,
}

impl PushReceiver for WebSocketReceiver {
	fn run(self: Box<Self>, frames: mpsc::UnboundedSender<PushFrame>) -> BoxFuture<'static, Result<()>> {
		let mut stream = self.stream;
		Box::pin(async move {
			while let Some(message) = stream.next().await {
				let frame = match message {
					Ok(Message::Text(text)) => PushFrame::from_text(&text),
					Ok(Message::Binary(bytes)) => PushFrame::Binary(bytes),
					Ok(Message::Close(reason)) => {
						debug!(target = "courier.ws", ?reason, "push connection closed by server");
						return Ok(());
					}
					Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
					Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
					Err(err) => return Err(Error::Network(format!("push receive failed: {err}"))),
				};
				if frames.send(frame).is_err() {
					return Ok(());
				}
			}
			Ok(())
		})
	}
}
