//! CLI configuration: JSON file, then environment, then flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use courier::SessionConfig;
use serde::{Deserialize, Serialize};

pub const ENV_BASE_URL: &str = "COURIER_BASE_URL";
pub const ENV_WEBSOCKET_URL: &str = "COURIER_WEBSOCKET_URL";
pub const ENV_COOKIE: &str = "COURIER_COOKIE";

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
	pub base_url: Option<String>,
	pub websocket_url: Option<String>,
	pub credential_path: Option<PathBuf>,
	pub cookie: Option<String>,
	pub session: Option<SessionConfig>,
}

impl ConfigFile {
	/// Reads `path`; a missing file yields the empty configuration.
	pub fn load(path: &Path) -> Result<Self> {
		let content = match std::fs::read_to_string(path) {
			Ok(content) => content,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
			Err(err) => return Err(err).with_context(|| format!("failed to read config {}", path.display())),
		};
		serde_json::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let json = serde_json::to_string_pretty(self)?;
		std::fs::write(path, json).with_context(|| format!("failed to write config {}", path.display()))
	}

	/// Overlays environment values found through `lookup`.
	pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
		let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
		if let Some(value) = non_empty(ENV_BASE_URL) {
			self.base_url = Some(value);
		}
		if let Some(value) = non_empty(ENV_WEBSOCKET_URL) {
			self.websocket_url = Some(value);
		}
		if let Some(value) = non_empty(ENV_COOKIE) {
			self.cookie = Some(value);
		}
	}

	pub fn apply_overrides(&mut self, overrides: &Overrides) {
		if let Some(value) = &overrides.base_url {
			self.base_url = Some(value.clone());
		}
		if let Some(value) = &overrides.websocket_url {
			self.websocket_url = Some(value.clone());
		}
		if let Some(value) = &overrides.cookie {
			self.cookie = Some(value.clone());
		}
		if let Some(value) = &overrides.credential_path {
			self.credential_path = Some(value.clone());
		}
		if let Some(max_concurrent) = overrides.max_concurrent {
			self.session.get_or_insert_with(SessionConfig::default).max_concurrent = max_concurrent;
		}
	}

	/// Validates and fills defaults.
	pub fn resolve(self) -> Result<Settings> {
		let Some(base_url) = self.base_url else {
			bail!("no base URL configured; set base_url, {ENV_BASE_URL} or --base-url");
		};
		let session = self.session.unwrap_or_default();
		if session.max_concurrent == 0 {
			bail!("max_concurrent must be at least 1");
		}
		Ok(Settings {
			base_url,
			websocket_url: self.websocket_url,
			credential_path: self.credential_path.unwrap_or_else(default_credential_path),
			cookie: self.cookie,
			session,
		})
	}
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub base_url: Option<String>,
	pub websocket_url: Option<String>,
	pub cookie: Option<String>,
	pub credential_path: Option<PathBuf>,
	pub max_concurrent: Option<usize>,
}

/// Fully resolved settings used to build a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
	pub base_url: String,
	pub websocket_url: Option<String>,
	pub credential_path: PathBuf,
	pub cookie: Option<String>,
	pub session: SessionConfig,
}

fn config_dir() -> PathBuf {
	dirs::config_dir()
		.or_else(|| dirs::home_dir().map(|home| home.join(".config")))
		.unwrap_or_else(|| PathBuf::from("."))
		.join("courier")
}

pub fn default_config_path() -> PathBuf {
	config_dir().join("config.json")
}

pub fn default_credential_path() -> PathBuf {
	config_dir().join("credential.json")
}

/// Loads the file at `path` (or the default location) and applies the
/// process environment and `overrides` on top.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Settings> {
	let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
	let mut file = ConfigFile::load(&path)?;
	file.apply_env(|key| std::env::var(key).ok());
	file.apply_overrides(overrides);
	file.resolve()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_base_url_is_reported() {
		let err = ConfigFile::default().resolve().unwrap_err();
		assert!(err.to_string().contains(ENV_BASE_URL));
	}

	#[test]
	fn zero_budget_is_rejected() {
		let mut file = ConfigFile {
			base_url: Some("https://example.test".into()),
			..ConfigFile::default()
		};
		file.apply_overrides(&Overrides {
			max_concurrent: Some(0),
			..Overrides::default()
		});
		assert!(file.resolve().is_err());
	}

	#[test]
	fn empty_environment_values_are_ignored() {
		let mut file = ConfigFile {
			cookie: Some("zuid=file".into()),
			..ConfigFile::default()
		};
		file.apply_env(|key| (key == ENV_COOKIE).then(String::new));
		assert_eq!(file.cookie.as_deref(), Some("zuid=file"));
	}
}
