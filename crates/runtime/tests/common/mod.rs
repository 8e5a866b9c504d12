#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

pub const WAIT: Duration = Duration::from_secs(5);

/// Serves `app` on an ephemeral localhost port.
pub async fn serve(app: Router) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let _server = tokio::spawn(async move {
		let _ = axum::serve(listener, app).await;
	});
	addr
}

/// Polls `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
	let deadline = tokio::time::Instant::now() + WAIT;
	while !condition() {
		assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}
