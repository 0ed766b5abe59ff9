//! SEU Auth Library
//!
//! This library signs clients into Southeast University's CAS-style single
//! sign-on service and hands back an authenticated HTTP session, taking
//! care of the moving parts the login hides: RSA credential encryption
//! against a server-issued key, captcha challenges, SMS second-factor
//! verification for untrusted devices, and token persistence for session
//! resume.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`client`] - HTTP transport bound to the backend endpoints
//! - [`protocol`] - Response envelope and outcome classification
//! - [`crypto`] - RSA PKCS#1 v1.5 credential encryption
//! - [`fingerprint`] - Device fingerprint and cipher key digests
//! - [`store`] - Token/fingerprint/correlation persistence
//! - [`challenge`] - Captcha and SMS code resolution seam
//! - [`manager`] - The login orchestrator tying it all together
//!
//! Most callers only need [`AuthManager`]:
//!
//! ```no_run
//! use seu_auth::AuthManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut manager = AuthManager::builder("220230001", "hunter2").build();
//! if let Some(session) = manager.login(false, "").await? {
//!     // session.client carries the authenticated cookies.
//! }
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod challenge;
pub mod client;
pub mod crypto;
pub mod fingerprint;
pub mod manager;
pub mod protocol;
pub mod store;

// Re-export commonly used types
pub use challenge::{ChallengeResolver, StdinChallengeResolver};
pub use client::{AuthClient, ClientError, ClientOptions, DEFAULT_BASE_URL, LoginForm};
pub use crypto::EncryptError;
pub use manager::{
    AuthError, AuthManager, AuthManagerBuilder, AuthSession, DEFAULT_MAX_STEP_RETRIES,
    DEFAULT_SMS_COOLDOWN,
};
pub use protocol::{
    CasPayload, CipherKeyStatus, LoginStatus, LoginSuccess, SessionVerdict, SmsDispatchStatus,
};
pub use store::{JsonFileStore, MemoryStore, SessionStore, StoreError};
