//! Token storage
//!
//! Credentials live in `~/.ieltsgo/credentials.json`. There is no refresh
//! flow here: an expired token is treated as absent and the user logs in again.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;

/// Source of the current bearer credential
///
/// Returns `None` when the user is not authenticated.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredTokens {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// Credentials persisted to disk
pub struct FileTokenStore {
    tokens: RwLock<Option<StoredTokens>>,
    storage_path: PathBuf,
}

impl FileTokenStore {
    pub fn default_path() -> PathBuf {
        ClientConfig::home_dir().join("credentials.json")
    }

    /// Load stored credentials; a missing or unreadable file means "logged out"
    pub fn load(storage_path: PathBuf) -> Self {
        let tokens = if storage_path.exists() {
            match fs::read_to_string(&storage_path) {
                Ok(content) => match serde_json::from_str::<StoredTokens>(&content) {
                    Ok(tokens) => {
                        info!("TokenStore: loaded credentials from {:?}", storage_path);
                        Some(tokens)
                    }
                    Err(e) => {
                        error!("TokenStore: failed to parse stored tokens: {}", e);
                        None
                    }
                },
                Err(e) => {
                    error!("TokenStore: failed to read token file: {}", e);
                    None
                }
            }
        } else {
            debug!("TokenStore: no credentials at {:?}", storage_path);
            None
        };

        Self {
            tokens: RwLock::new(tokens),
            storage_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    /// Persist new credentials and make them current
    pub fn save(&self, tokens: StoredTokens) -> Result<()> {
        if let Some(parent) = self.storage_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(&tokens)?;
        fs::write(&self.storage_path, json)
            .with_context(|| format!("Failed to write {:?}", self.storage_path))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = fs::metadata(&self.storage_path)?.permissions();
            permissions.set_mode(0o600);
            fs::set_permissions(&self.storage_path, permissions)?;
        }

        *self.tokens.write() = Some(tokens);
        Ok(())
    }

    /// Forget credentials (logout)
    pub fn clear(&self) -> Result<()> {
        *self.tokens.write() = None;
        if self.storage_path.exists() {
            fs::remove_file(&self.storage_path)
                .with_context(|| format!("Failed to remove {:?}", self.storage_path))?;
        }
        Ok(())
    }
}

impl TokenSource for FileTokenStore {
    fn token(&self) -> Option<String> {
        let guard = self.tokens.read();
        let tokens = guard.as_ref()?;
        if tokens.is_expired() {
            warn!("TokenStore: stored access token has expired");
            return None;
        }
        Some(tokens.access_token.clone())
    }
}

/// Settable in-memory credential
#[derive(Default)]
pub struct MemoryTokenSource {
    token: RwLock<Option<String>>,
}

impl MemoryTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl TokenSource for MemoryTokenSource {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_missing_file_has_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("credentials.json"));
        assert_eq!(store.token(), None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileTokenStore::load(path.clone());
        store.save(StoredTokens::new("abc123")).unwrap();
        assert_eq!(store.token(), Some("abc123".to_string()));

        let reloaded = FileTokenStore::load(path);
        assert_eq!(reloaded.token(), Some("abc123".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileTokenStore::load(path.clone());
        store.save(StoredTokens::new("secret")).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file_has_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(FileTokenStore::load(path).token(), None);
    }

    #[test]
    fn test_expired_token_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::load(dir.path().join("credentials.json"));
        store
            .save(StoredTokens {
                access_token: "old".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() - Duration::minutes(5)),
            })
            .unwrap();
        assert_eq!(store.token(), None);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileTokenStore::load(path.clone());
        store.save(StoredTokens::new("abc")).unwrap();
        store.clear().unwrap();
        assert!(!path.exists());
        assert_eq!(store.token(), None);
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[test]
    fn test_memory_source() {
        let source = MemoryTokenSource::default();
        assert_eq!(source.token(), None);
        source.set("t1");
        assert_eq!(source.token(), Some("t1".to_string()));
        source.clear();
        assert_eq!(source.token(), None);
    }
}
