use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use courier::protocol::{ConcurrencyGroup, Method, Priority};

use crate::config::Overrides;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Send requests and listen to push events through a courier session")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Configuration file (defaults to ~/.config/courier/config.json)
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Backend base URL
	#[arg(long, global = true, value_name = "URL")]
	pub base_url: Option<String>,

	/// Push channel WebSocket URL
	#[arg(long, global = true, value_name = "URL")]
	pub websocket_url: Option<String>,

	/// Login cookie used to renew the access credential
	#[arg(long, global = true)]
	pub cookie: Option<String>,

	/// Where the access credential is persisted
	#[arg(long, global = true, value_name = "FILE")]
	pub credential_path: Option<PathBuf>,

	/// Maximum number of requests in flight
	#[arg(long, global = true)]
	pub max_concurrent: Option<usize>,

	#[command(subcommand)]
	pub command: Commands,
}

impl Cli {
	pub fn overrides(&self) -> Overrides {
		Overrides {
			base_url: self.base_url.clone(),
			websocket_url: self.websocket_url.clone(),
			cookie: self.cookie.clone(),
			credential_path: self.credential_path.clone(),
			max_concurrent: self.max_concurrent,
		}
	}
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Send one request and print the response body
	#[command(alias = "req")]
	Request {
		/// Path relative to the base URL
		path: String,
		#[arg(short = 'X', long, default_value = "GET", value_parser = parse_method)]
		method: Method,
		/// JSON request body
		#[arg(short, long)]
		data: Option<String>,
		#[arg(long, value_enum, default_value = "normal")]
		priority: PriorityArg,
		/// Send through the background group
		#[arg(long)]
		background: bool,
		/// Send without an access credential
		#[arg(long)]
		no_auth: bool,
		/// Give up if the request cannot be dispatched in time (seconds)
		#[arg(long, default_value = "30")]
		timeout: u64,
	},

	/// Open the push channel and print frames as they arrive
	Listen {
		/// Exit after this many frames
		#[arg(short = 'n', long)]
		count: Option<usize>,
		/// Exit after this many seconds
		#[arg(long)]
		duration: Option<u64>,
	},

	/// Inspect or manage the stored access credential
	Credential {
		#[command(subcommand)]
		action: CredentialAction,
	},

	/// Print the effective configuration
	Config,
}

#[derive(Subcommand, Debug)]
pub enum CredentialAction {
	/// Show the stored credential (token redacted)
	Show,
	/// Renew now using the configured cookie
	Renew,
	/// Remove the stored credential
	Clear,
}

#[derive(Clone, Copy, Debug, ValueEnum, Default)]
pub enum PriorityArg {
	High,
	#[default]
	Normal,
	Low,
}

impl From<PriorityArg> for Priority {
	fn from(value: PriorityArg) -> Self {
		match value {
			PriorityArg::High => Priority::High,
			PriorityArg::Normal => Priority::Normal,
			PriorityArg::Low => Priority::Low,
		}
	}
}

pub fn group_for(background: bool) -> ConcurrencyGroup {
	if background { ConcurrencyGroup::Background } else { ConcurrencyGroup::Foreground }
}

fn parse_method(value: &str) -> Result<Method, String> {
	value.parse()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_flags_parse() {
		let cli = Cli::parse_from(["courier", "--base-url", "http://x", "request", "/self", "-X", "post", "--data", "{}", "--priority", "high"]);
		let Commands::Request { ref path, method, ref data, priority, .. } = cli.command else {
			panic!("expected request");
		};
		assert_eq!(path, "/self");
		assert_eq!(method, Method::Post);
		assert_eq!(data.as_deref(), Some("{}"));
		assert_eq!(Priority::from(priority), Priority::High);
		assert_eq!(cli.overrides().base_url.as_deref(), Some("http://x"));
	}

	#[test]
	fn unknown_method_is_rejected() {
		assert!(Cli::try_parse_from(["courier", "request", "/x", "-X", "fetch"]).is_err());
	}
}
