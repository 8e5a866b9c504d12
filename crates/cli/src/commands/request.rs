use std::time::Duration;

use anyhow::{Context, Result, bail};
use courier::protocol::{HttpResponse, Method, Priority};
use courier::{Error, HttpRequest};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cli::group_for;
use crate::context::CommandContext;

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct RequestOptions {
	pub path: String,
	pub method: Method,
	pub data: Option<String>,
	pub priority: Priority,
	pub background: bool,
	pub no_auth: bool,
	pub timeout_secs: u64,
}

impl RequestOptions {
	fn build(&self, body: Option<&Value>) -> HttpRequest {
		let mut request = HttpRequest::new(self.method, self.path.as_str())
			.with_priority(self.priority)
			.with_group(group_for(self.background))
			.expires_after(Duration::from_secs(self.timeout_secs));
		if let Some(body) = body {
			request = request.with_body(body.clone());
		}
		if self.no_auth {
			request = request.without_auth();
		}
		request
	}
}

pub async fn execute(ctx: &CommandContext, options: RequestOptions) -> Result<()> {
	let body = options
		.data
		.as_deref()
		.map(serde_json::from_str::<Value>)
		.transpose()
		.context("--data is not valid JSON")?;

	let response = send_with_retry(ctx, &options, body.as_ref()).await?;
	info!(target = "courier.session", path = %options.path, status = response.status, "response received");
	print_body(&response);
	if !response.is_success() {
		bail!("{} {} returned {}", options.method, options.path, response.status);
	}
	Ok(())
}

async fn send_with_retry(ctx: &CommandContext, options: &RequestOptions, body: Option<&Value>) -> Result<HttpResponse> {
	let mut attempt = 1;
	loop {
		let mut request = options.build(body);
		let completion = request.completion();
		let admission = ctx.session.enqueue_request(request);
		debug!(target = "courier.session", attempt, ?admission, "request admitted");

		match completion.wait().await {
			Ok(response) => return Ok(response),
			Err(Error::TryAgainLater) if attempt < MAX_ATTEMPTS => {
				warn!(target = "courier.session", attempt, "server asked to try again later");
				if !options.no_auth && ctx.session.credentials().is_renewing() {
					let _ = ctx.session.credentials().valid_credential().await;
				} else {
					tokio::time::sleep(RETRY_DELAY * attempt as u32).await;
				}
				attempt += 1;
			}
			Err(err) => return Err(err).with_context(|| format!("{} {} failed", options.method, options.path)),
		}
	}
}

fn print_body(response: &HttpResponse) {
	match response.json::<Value>() {
		Ok(value) => match serde_json::to_string_pretty(&value) {
			Ok(pretty) => println!("{pretty}"),
			Err(_) => println!("{}", response.text()),
		},
		Err(_) if response.body.is_empty() => {}
		Err(_) => println!("{}", response.text()),
	}
}
