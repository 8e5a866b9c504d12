use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use courier::PushChannelConsumer;
use courier::protocol::PushFrame;
use tokio::sync::mpsc;
use tracing::info;

use crate::context::CommandContext;

enum ListenEvent {
	Opened,
	Frame(PushFrame),
	Closed,
}

struct ForwardingConsumer {
	events: mpsc::UnboundedSender<ListenEvent>,
}

impl PushChannelConsumer for ForwardingConsumer {
	fn push_channel_did_receive(&self, frame: PushFrame) {
		let _ = self.events.send(ListenEvent::Frame(frame));
	}

	fn push_channel_did_open(&self) {
		let _ = self.events.send(ListenEvent::Opened);
	}

	fn push_channel_did_close(&self) {
		let _ = self.events.send(ListenEvent::Closed);
	}
}

pub async fn execute(ctx: &CommandContext, count: Option<usize>, duration: Option<u64>) -> Result<()> {
	if ctx.settings.websocket_url.is_none() {
		bail!("no push endpoint configured; set websocket_url, COURIER_WEBSOCKET_URL or --websocket-url");
	}
	let (tx, mut rx) = mpsc::unbounded_channel();
	ctx.session
		.open_push_channel(Arc::new(ForwardingConsumer { events: tx }))
		.context("failed to open push channel")?;

	let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
	let mut received = 0usize;
	loop {
		let sleep = async {
			match deadline {
				Some(deadline) => tokio::time::sleep_until(deadline).await,
				None => std::future::pending().await,
			}
		};
		tokio::select! {
			event = rx.recv() => match event {
				Some(ListenEvent::Opened) => info!(target = "courier.push", "push channel open"),
				Some(ListenEvent::Closed) => info!(target = "courier.push", "push channel closed; waiting to reconnect"),
				Some(ListenEvent::Frame(frame)) => {
					print_frame(&frame);
					received += 1;
					if count.is_some_and(|count| received >= count) {
						break;
					}
				}
				None => break,
			},
			() = sleep => break,
			_ = tokio::signal::ctrl_c() => break,
		}
	}
	ctx.session.close_push_channel();
	info!(target = "courier.push", received, "stopped listening");
	Ok(())
}

fn print_frame(frame: &PushFrame) {
	match frame {
		PushFrame::Json(value) => println!("{value}"),
		PushFrame::Binary(bytes) => println!("<{} bytes>", bytes.len()),
	}
}
