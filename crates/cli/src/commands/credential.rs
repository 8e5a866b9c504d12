use anyhow::{Context, Result, bail};
use courier::CredentialStore;
use courier::protocol::now_ts;
use courier_runtime::FileCredentialStore;
use tracing::info;

use crate::config::Settings;
use crate::context::CommandContext;

pub fn show(settings: &Settings) -> Result<()> {
	let store = FileCredentialStore::new(&settings.credential_path);
	let Some(credential) = store.load().context("failed to read stored credential")? else {
		println!("no credential stored at {}", settings.credential_path.display());
		return Ok(());
	};
	let now = now_ts();
	let expiry = match credential.expires_at {
		Some(at) if at > now => format!("expires in {}s", at - now),
		Some(_) => "expired".to_string(),
		None => "no expiry".to_string(),
	};
	println!("{} credential ({expiry}, valid: {})", credential.token_type, credential.is_valid());
	Ok(())
}

pub fn clear(settings: &Settings) -> Result<()> {
	let store = FileCredentialStore::new(&settings.credential_path);
	if store.clear().context("failed to remove stored credential")? {
		println!("removed {}", settings.credential_path.display());
	} else {
		println!("no credential stored");
	}
	Ok(())
}

pub async fn renew(ctx: &CommandContext) -> Result<()> {
	if ctx.settings.cookie.is_none() {
		bail!("renewal needs a login cookie; set cookie, COURIER_COOKIE or --cookie");
	}
	let credentials = ctx.session.credentials();
	let current = credentials.current();
	credentials.on_request_rejected_as_unauthorized(current.as_ref());
	let credential = credentials.valid_credential().await.context("credential renewal failed")?;
	info!(target = "courier.credential", path = %ctx.settings.credential_path.display(), "credential renewed");
	println!("renewed {} credential", credential.token_type);
	Ok(())
}
