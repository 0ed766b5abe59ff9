//! JSON-file-backed session store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{SessionStore, StoreError, StoredToken, TokenLookup, lookup_token, unix_now};

/// Layout of the backing document.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StoreDocument {
    fingerprint: Option<String>,
    tokens: HashMap<String, StoredToken>,
    correlations: HashMap<String, String>,
}

/// Session store persisting everything to one JSON document.
///
/// The file is read on each access and written through on each mutation,
/// serialized by an internal lock. A missing file starts empty; a corrupt
/// file is dropped with a warning rather than failing the login. The file
/// holds session tokens in the clear, so place it accordingly; hardened
/// secret storage is out of scope here.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Default file name used when no path is configured.
    pub const DEFAULT_FILE: &'static str = "auth_session.json";

    /// Creates a store backed by `path`. No I/O happens until first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<StoreDocument, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(document) => Ok(document),
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        %error,
                        "session store file is corrupt, starting empty"
                    );
                    Ok(StoreDocument::default())
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(StoreDocument::default())
            }
            Err(source) => Err(StoreError::io(&self.path, source)),
        }
    }

    async fn persist(&self, document: &StoreDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::io(parent, source))?;
        }
        let body = serde_json::to_vec_pretty(document).map_err(StoreError::encode)?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|source| StoreError::io(&self.path, source))
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn load_token(&self, username: &str) -> Result<Option<String>, StoreError> {
        let _io = self.io_lock.lock().await;
        let mut document = self.read_document().await?;
        match lookup_token(&mut document.tokens, username, unix_now()) {
            TokenLookup::Live(value) => Ok(Some(value)),
            TokenLookup::Evicted => {
                debug!(username, "stored token expired, evicting");
                self.persist(&document).await?;
                Ok(None)
            }
            TokenLookup::Absent => Ok(None),
        }
    }

    async fn save_token(
        &self,
        username: &str,
        token: &str,
        max_age: i64,
    ) -> Result<(), StoreError> {
        let _io = self.io_lock.lock().await;
        let mut document = self.read_document().await?;
        document.tokens.insert(
            username.to_string(),
            StoredToken::from_max_age(token.to_string(), max_age, unix_now()),
        );
        self.persist(&document).await
    }

    async fn load_fingerprint(&self) -> Result<Option<String>, StoreError> {
        let _io = self.io_lock.lock().await;
        Ok(self.read_document().await?.fingerprint)
    }

    async fn save_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        let _io = self.io_lock.lock().await;
        let mut document = self.read_document().await?;
        document.fingerprint = Some(fingerprint.to_string());
        self.persist(&document).await
    }

    async fn load_correlation(
        &self,
        key_fingerprint: &str,
    ) -> Result<Option<String>, StoreError> {
        let _io = self.io_lock.lock().await;
        Ok(self
            .read_document()
            .await?
            .correlations
            .get(key_fingerprint)
            .cloned())
    }

    async fn save_correlation(
        &self,
        key_fingerprint: &str,
        cookie: &str,
    ) -> Result<(), StoreError> {
        let _io = self.io_lock.lock().await;
        let mut document = self.read_document().await?;
        document
            .correlations
            .insert(key_fingerprint.to_string(), cookie.to_string());
        self.persist(&document).await
    }
}
