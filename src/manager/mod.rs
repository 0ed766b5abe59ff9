//! Login orchestration.
//!
//! [`AuthManager`] drives a complete sign-on against the CAS backend: it
//! prepares a device fingerprint, tries to resume a stored session, and
//! otherwise walks the login state machine (key exchange, captcha,
//! credential submit, SMS second factor) until the server accepts or the
//! attempt is abandoned. Human input is delegated to a
//! [`ChallengeResolver`]; persistence to a [`SessionStore`].
//!
//! # Overview
//!
//! ```no_run
//! use seu_auth::AuthManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut manager = AuthManager::builder("220230001", "hunter2").build();
//! if let Some(session) = manager.login(false, "https://ehall.seu.edu.cn/").await? {
//!     let response = session.client.get("https://ehall.seu.edu.cn/api/me").send().await?;
//!     println!("landed at {:?}, got {}", session.redirect_url, response.status());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Protocol-level failures (wrong password, cancelled captcha, exhausted
//! retries) come back as `Ok(None)`; `Err` is reserved for the environment
//! failing underneath the attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::challenge::{ChallengeResolver, StdinChallengeResolver};
use crate::client::{AuthClient, ClientError, ClientOptions};
use crate::fingerprint;
use crate::protocol::TGT_COOKIE;
use crate::protocol::classify::{self, SessionVerdict};
use crate::store::{JsonFileStore, SessionStore, StoreError};

mod fsm;

use fsm::AttemptContext;

/// Default number of consecutive repeats of one step before the attempt is
/// abandoned.
pub const DEFAULT_MAX_STEP_RETRIES: u32 = 3;

/// Default wait before retrying an SMS dispatch the server rate-limited.
pub const DEFAULT_SMS_COOLDOWN: Duration = Duration::from_secs(70);

/// Environment failures surfaced while standing a login attempt up.
///
/// Outcomes of the attempt itself (rejected credentials, unanswered
/// challenges, exhausted step budgets) are not errors; [`AuthManager::login`]
/// reports those as `Ok(None)`.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The HTTP transport could not be built or used.
    #[error(transparent)]
    Transport(#[from] ClientError),

    /// The session store could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An authenticated session handed to the caller after a successful login.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// HTTP client whose cookie jar holds the session token; requests made
    /// through it ride the authenticated session.
    pub client: reqwest::Client,

    /// Where the service asked to land after login, when it said.
    pub redirect_url: Option<String>,
}

/// Orchestrates login, session resume, and logout for one account.
pub struct AuthManager {
    username: String,
    password: String,
    resolver: Arc<dyn ChallengeResolver>,
    store: Arc<dyn SessionStore>,
    max_step_retries: u32,
    sms_cooldown: Duration,
    explicit_fingerprint: Option<String>,
    client: AuthClient,
    fingerprint: String,
    redirect_url: Option<String>,
}

// The password never leaves the struct unencrypted; keep it out of Debug
// output too.
impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManager")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("max_step_retries", &self.max_step_retries)
            .field("client", &self.client)
            .finish()
    }
}

impl AuthManager {
    /// Starts building a manager for one account.
    #[must_use]
    pub fn builder(username: impl Into<String>, password: impl Into<String>) -> AuthManagerBuilder {
        AuthManagerBuilder::new(username.into(), password.into())
    }

    /// Signs in, returning a ready-to-use session on success.
    ///
    /// Unless `force_refresh` is set, a stored token is probed first and
    /// reused when the server still accepts it. `service` is the URL the
    /// session is for; pass `""` for a plain portal login.
    ///
    /// `Ok(None)` means the attempt was abandoned: wrong credentials, an
    /// unanswered challenge, or a retry budget spent. The transport is
    /// closed in that case.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the transport cannot be built or the
    /// session store fails outside the retryable step loop.
    #[instrument(skip_all, fields(username = %self.username, force_refresh))]
    pub async fn login(
        &mut self,
        force_refresh: bool,
        service: &str,
    ) -> Result<Option<AuthSession>, AuthError> {
        self.client.open()?;
        self.prepare_fingerprint().await?;

        if !force_refresh && self.try_resume(service).await? {
            info!("resumed existing session");
            return Ok(Some(self.session()?));
        }

        let mut ctx = AttemptContext::new(service);
        if self.run_login_fsm(&mut ctx).await {
            info!("login succeeded");
            Ok(Some(self.session()?))
        } else {
            self.client.close();
            Ok(None)
        }
    }

    /// Invalidates the current session server-side.
    ///
    /// Returns whether the server reports the session gone; logging out
    /// while not logged in counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Transport`] when the logout request cannot be
    /// delivered.
    #[instrument(skip(self))]
    pub async fn logout(&mut self) -> Result<bool, AuthError> {
        self.client.open()?;
        let payload = self.client.logout().await?;
        let gone = classify::logout_succeeded(&payload);
        if gone {
            self.client.remove_cookie(TGT_COOKIE)?;
            info!("logged out");
        } else {
            warn!(code = ?payload.code, "logout rejected");
        }
        Ok(gone)
    }

    /// Fingerprint used for login submissions. Empty until the first
    /// [`login`](Self::login) call prepares it.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Settles which device fingerprint this attempt submits: an explicit
    /// override wins and is persisted, else the stored one is reused, else
    /// a fresh one is generated and persisted.
    async fn prepare_fingerprint(&mut self) -> Result<(), AuthError> {
        if let Some(explicit) = self.explicit_fingerprint.clone() {
            self.store.save_fingerprint(&explicit).await?;
            self.fingerprint = explicit;
            return Ok(());
        }
        if let Some(stored) = self.store.load_fingerprint().await? {
            self.fingerprint = stored;
            return Ok(());
        }
        let generated = fingerprint::generate();
        debug!(fingerprint = %generated, "generated device fingerprint");
        self.store.save_fingerprint(&generated).await?;
        self.fingerprint = generated;
        Ok(())
    }

    /// Tries to reuse a stored token. `true` means the server accepted it
    /// and the live jar now carries a valid session. Probe transport errors
    /// are not fatal; the stale cookie is dropped and a fresh login runs.
    async fn try_resume(&mut self, service: &str) -> Result<bool, AuthError> {
        let Some(token) = self.store.load_token(&self.username).await? else {
            return Ok(false);
        };
        debug!("probing stored session token");
        self.client.set_cookie(TGT_COOKIE, &token)?;

        let service_arg = (!service.is_empty()).then_some(service);
        match self.client.verify_tgt(None, service_arg).await {
            Ok(payload) => match classify::classify_verify_tgt(&payload) {
                SessionVerdict::Valid { redirect_url } => {
                    self.redirect_url = redirect_url;
                    Ok(true)
                }
                SessionVerdict::Invalid => {
                    debug!("stored token no longer accepted");
                    self.client.remove_cookie(TGT_COOKIE)?;
                    Ok(false)
                }
            },
            Err(error) => {
                warn!(%error, "session probe failed, falling back to fresh login");
                self.client.remove_cookie(TGT_COOKIE)?;
                Ok(false)
            }
        }
    }

    fn session(&mut self) -> Result<AuthSession, AuthError> {
        Ok(AuthSession {
            client: self.client.http_client()?,
            redirect_url: self.redirect_url.take(),
        })
    }
}

/// Builder for [`AuthManager`].
///
/// Every knob has a production default: stdin challenge prompts, a
/// [`JsonFileStore`] at [`JsonFileStore::DEFAULT_FILE`], three tries per
/// step, and a 70 second SMS cooldown.
pub struct AuthManagerBuilder {
    username: String,
    password: String,
    resolver: Arc<dyn ChallengeResolver>,
    store: Arc<dyn SessionStore>,
    max_step_retries: u32,
    sms_cooldown: Duration,
    fingerprint: Option<String>,
    client_options: ClientOptions,
}

impl AuthManagerBuilder {
    fn new(username: String, password: String) -> Self {
        Self {
            username,
            password,
            resolver: Arc::new(StdinChallengeResolver),
            store: Arc::new(JsonFileStore::new(JsonFileStore::DEFAULT_FILE)),
            max_step_retries: DEFAULT_MAX_STEP_RETRIES,
            sms_cooldown: DEFAULT_SMS_COOLDOWN,
            fingerprint: None,
            client_options: ClientOptions::default(),
        }
    }

    /// Replaces the interactive challenge resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ChallengeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replaces the session store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Caps how often one step may repeat before the attempt is abandoned.
    #[must_use]
    pub fn max_step_retries(mut self, retries: u32) -> Self {
        self.max_step_retries = retries;
        self
    }

    /// Wait time after a rate-limited SMS dispatch.
    #[must_use]
    pub fn sms_cooldown(mut self, cooldown: Duration) -> Self {
        self.sms_cooldown = cooldown;
        self
    }

    /// Pins the device fingerprint instead of loading or generating one.
    #[must_use]
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Points the transport at a different backend base URL.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.client_options.base_url = base_url.into();
        self
    }

    /// Per-request HTTP timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.client_options.timeout = timeout;
        self
    }

    /// Extra HTTP headers merged over the transport defaults.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.client_options.headers = headers;
        self
    }

    /// Finishes the build. The transport stays closed until the first
    /// [`AuthManager::login`] call.
    #[must_use]
    pub fn build(self) -> AuthManager {
        AuthManager {
            username: self.username,
            password: self.password,
            resolver: self.resolver,
            store: self.store,
            max_step_retries: self.max_step_retries,
            sms_cooldown: self.sms_cooldown,
            explicit_fingerprint: self.fingerprint,
            client: AuthClient::with_options(self.client_options),
            fingerprint: String::new(),
            redirect_url: None,
        }
    }
}
