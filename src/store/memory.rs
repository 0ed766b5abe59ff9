//! In-memory session store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{SessionStore, StoreError, StoredToken, TokenLookup, lookup_token, unix_now};

/// Session store that keeps everything in process memory.
///
/// Nothing survives a restart. Useful for tests and for embedders that
/// persist state through their own channels.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    fingerprint: Option<String>,
    tokens: HashMap<String, StoredToken>,
    correlations: HashMap<String, String>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_token(&self, username: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.inner.lock().await;
        match lookup_token(&mut state.tokens, username, unix_now()) {
            TokenLookup::Live(value) => Ok(Some(value)),
            TokenLookup::Evicted | TokenLookup::Absent => Ok(None),
        }
    }

    async fn save_token(
        &self,
        username: &str,
        token: &str,
        max_age: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        state.tokens.insert(
            username.to_string(),
            StoredToken::from_max_age(token.to_string(), max_age, unix_now()),
        );
        Ok(())
    }

    async fn load_fingerprint(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.fingerprint.clone())
    }

    async fn save_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.inner.lock().await.fingerprint = Some(fingerprint.to_string());
        Ok(())
    }

    async fn load_correlation(
        &self,
        key_fingerprint: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .correlations
            .get(key_fingerprint)
            .cloned())
    }

    async fn save_correlation(
        &self,
        key_fingerprint: &str,
        cookie: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .correlations
            .insert(key_fingerprint.to_string(), cookie.to_string());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_store() {
        let store = MemoryStore::new();
        assert_eq!(store.load_token("220230001").await.unwrap(), None);
        assert_eq!(store.load_fingerprint().await.unwrap(), None);
        assert_eq!(store.load_correlation("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_round_trips() {
        let store = MemoryStore::new();
        store.save_token("220230001", "TGT-1", -1).await.unwrap();
        store.save_fingerprint("cafebabe").await.unwrap();
        store.save_correlation("keyhash", "uid-9").await.unwrap();

        assert_eq!(
            store.load_token("220230001").await.unwrap(),
            Some("TGT-1".to_string())
        );
        assert_eq!(
            store.load_fingerprint().await.unwrap(),
            Some("cafebabe".to_string())
        );
        assert_eq!(
            store.load_correlation("keyhash").await.unwrap(),
            Some("uid-9".to_string())
        );
    }

    #[tokio::test]
    async fn test_save_token_overwrites() {
        let store = MemoryStore::new();
        store.save_token("220230001", "TGT-old", -1).await.unwrap();
        store.save_token("220230001", "TGT-new", -1).await.unwrap();
        assert_eq!(
            store.load_token("220230001").await.unwrap(),
            Some("TGT-new".to_string())
        );
    }
}
