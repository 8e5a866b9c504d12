mod config;
mod credential;
mod listen;
mod request;

use anyhow::Result;

use crate::cli::{Commands, CredentialAction};
use crate::config::Settings;
use crate::context::CommandContext;

pub async fn dispatch(command: Commands, settings: Settings) -> Result<()> {
	match command {
		Commands::Config => config::execute(&settings),
		Commands::Credential { action: CredentialAction::Show } => credential::show(&settings),
		Commands::Credential { action: CredentialAction::Clear } => credential::clear(&settings),
		Commands::Credential { action: CredentialAction::Renew } => {
			let ctx = CommandContext::new(settings)?;
			credential::renew(&ctx).await
		}
		Commands::Request { path, method, data, priority, background, no_auth, timeout } => {
			let ctx = CommandContext::new(settings)?;
			request::execute(
				&ctx,
				request::RequestOptions {
					path,
					method,
					data,
					priority: priority.into(),
					background,
					no_auth,
					timeout_secs: timeout,
				},
			)
			.await
		}
		Commands::Listen { count, duration } => {
			let ctx = CommandContext::new(settings)?;
			listen::execute(&ctx, count, duration).await
		}
	}
}
