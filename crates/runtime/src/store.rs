//! Credential persistence on the local filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use courier::{CredentialStore, Result};
use courier_protocol::Credential;
use tracing::debug;

/// Stores the last good credential as a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
	path: PathBuf,
}

impl FileCredentialStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl CredentialStore for FileCredentialStore {
	fn load(&self) -> Result<Option<Credential>> {
		let content = match fs::read_to_string(&self.path) {
			Ok(content) => content,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};
		let credential: Credential = serde_json::from_str(&content)?;
		debug!(target = "courier.store", path = %self.path.display(), "loaded credential");
		Ok(Some(credential))
	}

	fn save(&self, credential: &Credential) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)?;
		}
		let json = serde_json::to_string_pretty(credential)?;
		fs::write(&self.path, json)?;
		debug!(target = "courier.store", path = %self.path.display(), "saved credential");
		Ok(())
	}

	fn clear(&self) -> Result<bool> {
		match fs::remove_file(&self.path) {
			Ok(()) => Ok(true),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(err) => Err(err.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_loads_as_none() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileCredentialStore::new(dir.path().join("credential.json"));
		assert!(store.load().unwrap().is_none());
		assert!(!store.clear().unwrap());
	}

	#[test]
	fn saves_into_nested_directories_and_clears() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileCredentialStore::new(dir.path().join("profiles/default/credential.json"));
		let credential = Credential::bearer("abc").with_expires_at(4_000_000_000);
		store.save(&credential).unwrap();

		assert_eq!(store.load().unwrap(), Some(credential));
		assert!(store.clear().unwrap());
		assert!(store.load().unwrap().is_none());
	}

	#[test]
	fn corrupt_file_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("credential.json");
		fs::write(&path, "{not json").unwrap();
		let store = FileCredentialStore::new(path);
		assert!(matches!(store.load(), Err(courier::Error::Json(_))));
	}
}
