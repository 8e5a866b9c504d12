//! Builds a session from resolved settings.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier::protocol::ReachabilityState;
use courier::{ReachabilityObserver, Session};
use courier_runtime::{CookieRenewer, FileCredentialStore, HttpTransport, TcpProbe, WebSocketPushTransport};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Settings;

/// A running session plus the background probe that feeds its reachability.
pub struct CommandContext {
	pub session: Session,
	pub settings: Settings,
	probe: Option<JoinHandle<()>>,
}

impl CommandContext {
	pub fn new(settings: Settings) -> Result<Self> {
		let transport = HttpTransport::new(&settings.base_url).context("invalid base URL")?;
		let reachability = Arc::new(ReachabilityObserver::new(ReachabilityState::Unknown));
		let probe = TcpProbe::for_url(transport.base_url()).map(|probe| probe.spawn(Arc::clone(&reachability)));

		let mut builder = Session::builder(Arc::new(transport))
			.name("cli")
			.config(settings.session.clone())
			.reachability(reachability)
			.credential_store(Arc::new(FileCredentialStore::new(&settings.credential_path)));
		if let Some(cookie) = &settings.cookie {
			builder = builder.renewer(Arc::new(CookieRenewer::new(&settings.base_url, cookie.as_str())?));
		}
		if let Some(url) = &settings.websocket_url {
			builder = builder.push_transport(Arc::new(WebSocketPushTransport::new(url.as_str())));
		}
		let session = builder.build().context("failed to start session")?;
		debug!(target = "courier.session", base_url = %settings.base_url, push = settings.websocket_url.is_some(), "session ready");

		Ok(Self { session, settings, probe })
	}
}

impl Drop for CommandContext {
	fn drop(&mut self) {
		self.session.tear_down();
		if let Some(probe) = self.probe.take() {
			probe.abort();
		}
	}
}
