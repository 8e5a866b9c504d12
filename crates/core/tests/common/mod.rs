#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use courier::protocol::{Credential, HttpResponse};
use courier::testing::{FakePushTransport, FakeRenewer, FakeTransport};
use courier::{Completion, MemoryCredentialStore, Session, SessionBus, SessionConfig};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
	pub session: Session,
	pub transport: FakeTransport,
	pub renewer: FakeRenewer,
	pub push: FakePushTransport,
	pub bus: SessionBus,
}

pub struct HarnessBuilder {
	transport: FakeTransport,
	renewer: FakeRenewer,
	credential: Option<Credential>,
	config: SessionConfig,
	bus: SessionBus,
}

impl HarnessBuilder {
	pub fn new() -> Self {
		Self {
			transport: FakeTransport::new(),
			renewer: FakeRenewer::new(),
			credential: Some(Credential::bearer("seed")),
			config: SessionConfig::default(),
			bus: SessionBus::new(),
		}
	}

	pub fn gated(mut self) -> Self {
		self.transport = FakeTransport::gated();
		self
	}

	pub fn held_renewals(mut self) -> Self {
		self.renewer = FakeRenewer::held();
		self
	}

	pub fn credential(mut self, credential: Option<Credential>) -> Self {
		self.credential = credential;
		self
	}

	pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
		self.config.max_concurrent = max_concurrent;
		self
	}

	pub fn config(mut self, config: SessionConfig) -> Self {
		self.config = config;
		self
	}

	pub fn bus(mut self, bus: SessionBus) -> Self {
		self.bus = bus;
		self
	}

	pub fn build(self) -> Harness {
		init_tracing();
		let store = match self.credential {
			Some(credential) => MemoryCredentialStore::with_credential(credential),
			None => MemoryCredentialStore::new(),
		};
		let push = FakePushTransport::new();
		let session = Session::builder(Arc::new(self.transport.clone()))
			.push_transport(Arc::new(push.clone()))
			.renewer(Arc::new(self.renewer.clone()))
			.credential_store(Arc::new(store))
			.config(self.config)
			.bus(self.bus.clone())
			.build()
			.expect("session should build inside a runtime");
		Harness {
			session,
			transport: self.transport,
			renewer: self.renewer,
			push,
			bus: self.bus,
		}
	}
}

/// Installs a test-writer subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")))
		.with_test_writer()
		.try_init();
}

/// Waits for a request outcome, failing the test if it never arrives.
pub async fn outcome(completion: Completion) -> courier::Result<HttpResponse> {
	tokio::time::timeout(WAIT, completion.wait()).await.expect("request outcome should arrive")
}

/// Polls `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
	let deadline = tokio::time::Instant::now() + WAIT;
	while !condition() {
		assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

/// Lets spawned tasks run for a moment.
pub async fn settle() {
	tokio::time::sleep(Duration::from_millis(50)).await;
}
