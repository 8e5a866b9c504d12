//! HTTP transport backed by `reqwest`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier::request::HttpRequest;
use courier::{Error, Result, Transport, TransportOutcome};
use courier_protocol::{BackgroundTask, ConcurrencyGroup, Credential, HttpResponse, Method, now_ts};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Client, Url};
use tracing::{debug, warn};

/// Default timeout for foreground requests.
pub const FOREGROUND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for background-group transfers.
pub const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(600);

/// Sends session requests to a fixed base URL.
///
/// Foreground and background requests use separate clients so long-running
/// transfers never share a connection pool or timeout with interactive calls.
pub struct HttpTransport {
	base: Url,
	foreground: Client,
	background: Client,
	tasks: Arc<Mutex<HashMap<u64, BackgroundTask>>>,
	next_task: AtomicU64,
}

impl HttpTransport {
	pub fn new(base_url: &str) -> Result<Self> {
		Self::with_timeouts(base_url, FOREGROUND_TIMEOUT, BACKGROUND_TIMEOUT)
	}

	pub fn with_timeouts(base_url: &str, foreground: Duration, background: Duration) -> Result<Self> {
		let base = parse_base(base_url)?;
		Ok(Self {
			base,
			foreground: build_client(foreground)?,
			background: build_client(background)?,
			tasks: Arc::new(Mutex::new(HashMap::new())),
			next_task: AtomicU64::new(1),
		})
	}

	pub fn base_url(&self) -> &Url {
		&self.base
	}

	/// Resolves `path` against the base URL, keeping any base path prefix.
	pub fn url_for(&self, path: &str) -> Result<Url> {
		self.base
			.join(path.trim_start_matches('/'))
			.map_err(|err| Error::Invalid(format!("bad request path {path:?}: {err}")))
	}

	fn client_for(&self, group: ConcurrencyGroup) -> &Client {
		match group {
			ConcurrencyGroup::Foreground => &self.foreground,
			ConcurrencyGroup::Background => &self.background,
		}
	}

	fn track(&self, request: &HttpRequest) -> Option<TaskGuard> {
		if request.group != ConcurrencyGroup::Background {
			return None;
		}
		let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);
		let task = BackgroundTask {
			task_id,
			request_id: request.id().get(),
			method: request.method,
			path: request.path.clone(),
			started_at: now_ts(),
		};
		let _ = self.tasks.lock().insert(task_id, task);
		Some(TaskGuard {
			tasks: Arc::clone(&self.tasks),
			task_id,
		})
	}

	async fn send(&self, request: &HttpRequest, credential: Option<&Credential>) -> TransportOutcome {
		let url = match self.url_for(&request.path) {
			Ok(url) => url,
			Err(err) => return TransportOutcome::NetworkError(err.to_string()),
		};
		let mut builder = self.client_for(request.group).request(reqwest_method(request.method), url);
		if let Some(credential) = credential {
			match HeaderValue::from_str(&credential.authorization()) {
				Ok(value) => builder = builder.header(AUTHORIZATION, value),
				Err(err) => return TransportOutcome::NetworkError(format!("invalid credential header: {err}")),
			}
		}
		if let Some(body) = &request.body {
			builder = builder.json(body);
		}

		let response = match builder.send().await {
			Ok(response) => response,
			Err(err) => {
				warn!(target = "courier.http", request_id = %request.id(), path = %request.path, error = %err, "request failed");
				return TransportOutcome::NetworkError(describe(&err));
			}
		};
		let status = response.status().as_u16();
		match response.bytes().await {
			Ok(body) => {
				debug!(target = "courier.http", request_id = %request.id(), path = %request.path, status, bytes = body.len(), "response received");
				TransportOutcome::Response(HttpResponse::new(status, body.to_vec()))
			}
			Err(err) => {
				warn!(target = "courier.http", request_id = %request.id(), status, error = %err, "failed to read response body");
				TransportOutcome::NetworkError(describe(&err))
			}
		}
	}
}

impl Transport for HttpTransport {
	fn dispatch<'a>(&'a self, request: &'a HttpRequest, credential: Option<&'a Credential>) -> BoxFuture<'a, TransportOutcome> {
		Box::pin(async move {
			let _task = self.track(request);
			self.send(request, credential).await
		})
	}

	fn background_tasks(&self) -> BoxFuture<'_, Vec<BackgroundTask>> {
		Box::pin(async move {
			let mut tasks: Vec<BackgroundTask> = self.tasks.lock().values().cloned().collect();
			tasks.sort_by_key(|task| task.task_id);
			tasks
		})
	}
}

/// Removes a background task entry when its dispatch ends or is dropped.
struct TaskGuard {
	tasks: Arc<Mutex<HashMap<u64, BackgroundTask>>>,
	task_id: u64,
}

impl Drop for TaskGuard {
	fn drop(&mut self) {
		let _ = self.tasks.lock().remove(&self.task_id);
	}
}

pub(crate) fn parse_base(base_url: &str) -> Result<Url> {
	let mut base = Url::parse(base_url).map_err(|err| Error::Invalid(format!("bad base URL {base_url:?}: {err}")))?;
	if !base.path().ends_with('/') {
		let path = format!("{}/", base.path());
		base.set_path(&path);
	}
	Ok(base)
}

pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
	Client::builder()
		.timeout(timeout)
		.build()
		.map_err(|err| Error::Network(format!("failed to create HTTP client: {err}")))
}

fn reqwest_method(method: Method) -> reqwest::Method {
	match method {
		Method::Get => reqwest::Method::GET,
		Method::Post => reqwest::Method::POST,
		Method::Put => reqwest::Method::PUT,
		Method::Patch => reqwest::Method::PATCH,
		Method::Delete => reqwest::Method::DELETE,
		Method::Head => reqwest::Method::HEAD,
	}
}

fn describe(err: &reqwest::Error) -> String {
	if err.is_timeout() {
		format!("timed out: {err}")
	} else if err.is_connect() {
		format!("connection failed: {err}")
	} else {
		err.to_string()
	}
}
