use anyhow::Result;
use serde_json::json;

use crate::config::Settings;

pub fn execute(settings: &Settings) -> Result<()> {
	let view = json!({
		"base_url": settings.base_url,
		"websocket_url": settings.websocket_url,
		"credential_path": settings.credential_path,
		"cookie": settings.cookie.as_ref().map(|_| "<set>"),
		"session": settings.session,
	});
	println!("{}", serde_json::to_string_pretty(&view)?);
	Ok(())
}
