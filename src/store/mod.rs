//! Session persistence.
//!
//! Three pieces of login state survive process restarts: the ticket-granting
//! token per account, the device fingerprint, and the cache correlating
//! cipher keys with their session cookies. The orchestrator decides when to
//! read and write; a [`SessionStore`] only holds the data.
//!
//! Two implementations ship with the crate: [`JsonFileStore`] for the
//! common single-file case and [`MemoryStore`] for tests and embedders that
//! manage persistence themselves.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Errors from session store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing storage failed.
    #[error("session store I/O failed at {path}: {source}")]
    Io {
        /// Path of the backing file or directory.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Encoding the store contents for persistence failed.
    #[error("failed to encode session store contents: {source}")]
    Encode {
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },
}

// Constructors take the context explicitly instead of blanket From impls;
// a bare io::Error without its path is useless in logs.
impl StoreError {
    /// Creates an I/O error carrying the affected path.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Creates an encoding error.
    pub fn encode(source: serde_json::Error) -> Self {
        Self::Encode { source }
    }
}

/// Persistence seam for login state.
///
/// Implementations are shared behind `Arc` and called from async context.
/// Absence is `Ok(None)`; errors are reserved for storage faults. Expiry is
/// the store's business: an expired token must never be returned.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the stored token for `username`, if present and not expired.
    async fn load_token(&self, username: &str) -> Result<Option<String>, StoreError>;

    /// Stores a token for `username`. `max_age` is the server-reported
    /// lifetime in seconds; non-positive means no time-based expiry.
    async fn save_token(&self, username: &str, token: &str, max_age: i64)
    -> Result<(), StoreError>;

    /// Loads the persisted device fingerprint.
    async fn load_fingerprint(&self) -> Result<Option<String>, StoreError>;

    /// Stores the device fingerprint.
    async fn save_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError>;

    /// Loads the correlation cookie cached under a key fingerprint.
    async fn load_correlation(&self, key_fingerprint: &str)
    -> Result<Option<String>, StoreError>;

    /// Caches the correlation cookie under a key fingerprint.
    async fn save_correlation(
        &self,
        key_fingerprint: &str,
        cookie: &str,
    ) -> Result<(), StoreError>;
}

/// A stored token with its optional absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredToken {
    pub value: String,
    /// Unix seconds after which the token is stale; `None` never expires.
    pub expires_at: Option<u64>,
}

impl StoredToken {
    /// Builds a record from a server-reported max-age relative to `now`.
    ///
    /// Non-positive ages mean the server manages the lifetime; such tokens
    /// stay valid until a verification probe rejects them.
    pub fn from_max_age(value: String, max_age: i64, now: u64) -> Self {
        let expires_at = u64::try_from(max_age)
            .ok()
            .filter(|age| *age > 0)
            .map(|age| now.saturating_add(age));
        Self { value, expires_at }
    }

    /// Whether the record is still usable at `now`. The expiry instant
    /// itself counts as expired.
    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Result of looking a token up in a map, with eviction applied.
pub(crate) enum TokenLookup {
    /// A live token was found.
    Live(String),
    /// An expired token was found and removed; callers owning durable
    /// storage should persist the eviction.
    Evicted,
    /// No record for this user.
    Absent,
}

/// Shared lookup-and-evict logic for map-backed stores.
pub(crate) fn lookup_token(
    tokens: &mut HashMap<String, StoredToken>,
    username: &str,
    now: u64,
) -> TokenLookup {
    let found = tokens
        .get(username)
        .map(|entry| (entry.value.clone(), entry.is_live(now)));
    match found {
        Some((value, true)) => TokenLookup::Live(value),
        Some((_, false)) => {
            tokens.remove(username);
            TokenLookup::Evicted
        }
        None => TokenLookup::Absent,
    }
}

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
