//! Reachability probing by opening TCP connections.

use std::sync::Arc;
use std::time::Duration;

use courier::ReachabilityObserver;
use courier_protocol::ReachabilityState;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// Periodically checks that a host:port accepts connections.
#[derive(Debug, Clone)]
pub struct TcpProbe {
	host: String,
	port: u16,
	interval: Duration,
	timeout: Duration,
}

impl TcpProbe {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
			interval: Duration::from_secs(10),
			timeout: Duration::from_secs(3),
		}
	}

	/// Derives host and port from a URL, using the scheme's default port.
	pub fn for_url(url: &reqwest::Url) -> Option<Self> {
		let host = url.host_str()?;
		let port = url.port_or_known_default()?;
		Some(Self::new(host, port))
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn target(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Returns `true` when a TCP connection succeeds within the timeout.
	pub async fn check(&self) -> bool {
		matches!(
			tokio::time::timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await,
			Ok(Ok(_))
		)
	}

	/// Probes once and publishes the result to `observer`.
	pub async fn probe_once(&self, observer: &ReachabilityObserver) -> ReachabilityState {
		let state = if self.check().await {
			ReachabilityState::Reachable
		} else {
			ReachabilityState::Unreachable
		};
		if observer.update(state) {
			debug!(target = "courier.reachability", target_addr = %self.target(), ?state, "probe changed reachability");
		}
		state
	}

	/// Probes on a fixed interval until the returned handle is aborted.
	pub fn spawn(self, observer: Arc<ReachabilityObserver>) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(self.interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				let _ = ticker.tick().await;
				let _ = self.probe_once(&observer).await;
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn listening_port_is_reachable() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let observer = ReachabilityObserver::new(ReachabilityState::Unknown);

		let state = TcpProbe::new("127.0.0.1", port).probe_once(&observer).await;
		assert_eq!(state, ReachabilityState::Reachable);
		assert_eq!(observer.current_state(), ReachabilityState::Reachable);
	}

	#[tokio::test]
	async fn closed_port_is_unreachable() {
		let port = {
			let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
			listener.local_addr().unwrap().port()
		};
		let observer = ReachabilityObserver::new(ReachabilityState::Reachable);

		let probe = TcpProbe::new("127.0.0.1", port).with_timeout(Duration::from_millis(500));
		assert_eq!(probe.probe_once(&observer).await, ReachabilityState::Unreachable);
		assert!(!observer.is_reachable());
	}

	#[test]
	fn url_targets_use_default_ports() {
		let url = reqwest::Url::parse("https://chat.example.test/api").unwrap();
		assert_eq!(TcpProbe::for_url(&url).unwrap().target(), "chat.example.test:443");
	}
}
