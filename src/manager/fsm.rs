//! Login state machine.
//!
//! Four working steps: fetch the cipher key, settle the captcha, submit
//! the credentials, handle the SMS second factor. Each handler returns the
//! next step; returning the current step counts as a retry against a
//! per-step budget tracked centrally by the loop. Transport and store
//! errors inside a handler are logged and retried in place rather than
//! propagated, so one flaky request does not kill the attempt.

use tracing::{debug, error, info, warn};

use crate::client::LoginForm;
use crate::crypto;
use crate::fingerprint;
use crate::protocol::CORRELATION_COOKIE;
use crate::protocol::classify::{self, CipherKeyStatus, LoginStatus, SmsDispatchStatus};

use super::{AuthError, AuthManager};

/// Steps of the login state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AuthStep {
    /// Obtain the RSA key and encrypt the staged secrets.
    FetchCipherKey,
    /// Find out whether a captcha is required and solve it.
    HandleCaptcha,
    /// Submit the login form.
    PerformLogin,
    /// Request and collect the SMS verification code.
    HandleStage2,
    /// Terminal: the server accepted the login.
    Success,
    /// Terminal: the attempt was abandoned.
    Failed,
}

impl AuthStep {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    fn name(self) -> &'static str {
        match self {
            Self::FetchCipherKey => "fetch_cipher_key",
            Self::HandleCaptcha => "handle_captcha",
            Self::PerformLogin => "perform_login",
            Self::HandleStage2 => "handle_stage2",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Scratch state for one login attempt.
///
/// Secrets staged here are ciphertext except `sms_code`, which has to be
/// kept in the clear between dispatch and the re-encryption pass.
#[derive(Default)]
pub(super) struct AttemptContext {
    service: String,
    encrypted_password: Option<String>,
    captcha_code: Option<String>,
    sms_code: Option<String>,
    encrypted_sms_code: Option<String>,
    phone: Option<String>,
}

impl AttemptContext {
    pub(super) fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ..Self::default()
        }
    }
}

impl AuthManager {
    /// Drives the state machine to a terminal step. Returns whether the
    /// attempt ended in [`AuthStep::Success`].
    pub(super) async fn run_login_fsm(&mut self, ctx: &mut AttemptContext) -> bool {
        let mut step = AuthStep::FetchCipherKey;
        let mut step_retries: u32 = 0;

        loop {
            if step.is_terminal() {
                return step == AuthStep::Success;
            }
            if step_retries >= self.max_step_retries {
                error!(
                    step = step.name(),
                    retries = step_retries,
                    "step retry budget exhausted, abandoning attempt"
                );
                return false;
            }

            debug!(step = step.name(), retries = step_retries, "executing step");
            match self.execute_step(step, ctx).await {
                Ok(next) => {
                    if next == step {
                        step_retries += 1;
                    } else {
                        step_retries = 0;
                    }
                    step = next;
                }
                Err(error) => {
                    warn!(step = step.name(), %error, "step errored, retrying");
                    step_retries += 1;
                }
            }
        }
    }

    async fn execute_step(
        &mut self,
        step: AuthStep,
        ctx: &mut AttemptContext,
    ) -> Result<AuthStep, AuthError> {
        match step {
            AuthStep::FetchCipherKey => self.step_fetch_cipher_key(ctx).await,
            AuthStep::HandleCaptcha => self.step_handle_captcha(ctx).await,
            AuthStep::PerformLogin => self.step_perform_login(ctx).await,
            AuthStep::HandleStage2 => self.step_handle_stage2(ctx).await,
            // Terminals are filtered by the loop before dispatch.
            AuthStep::Success | AuthStep::Failed => Ok(step),
        }
    }

    /// Obtains the RSA key, reconciles the key-correlation cookie, and
    /// encrypts the password (and any staged SMS code) under it.
    async fn step_fetch_cipher_key(
        &mut self,
        ctx: &mut AttemptContext,
    ) -> Result<AuthStep, AuthError> {
        let payload = self.client.fetch_cipher_key().await?;
        let (public_key, reused) = match classify::classify_cipher_key(&payload) {
            CipherKeyStatus::Issued { public_key } => (public_key, false),
            CipherKeyStatus::Reused { public_key } => (public_key, true),
            CipherKeyStatus::Failed => {
                warn!(code = ?payload.code, "cipher key request rejected");
                return Ok(AuthStep::FetchCipherKey);
            }
        };
        debug!(reused, "cipher key obtained");

        // The server only accepts ciphertext accompanied by the correlation
        // cookie it minted alongside the key. A fresh issue sets the cookie
        // in our jar; a reused key does not, so it must come from the store.
        let key_id = fingerprint::hash_public_key(&public_key);
        match self.client.cookie(CORRELATION_COOKIE)? {
            Some(correlation) => {
                self.store.save_correlation(&key_id, &correlation).await?;
            }
            None => match self.store.load_correlation(&key_id).await? {
                Some(correlation) => {
                    debug!("restored key correlation cookie from store");
                    self.client.set_cookie(CORRELATION_COOKIE, &correlation)?;
                }
                None => {
                    // No way to pair with this key. Drop all cookies so the
                    // server mints a fresh key on the next try.
                    warn!("reused cipher key with no cached correlation, resetting cookies");
                    self.client.clear_cookies()?;
                    return Ok(AuthStep::FetchCipherKey);
                }
            },
        }

        match crypto::encrypt(&self.password, &public_key) {
            Ok(ciphertext) => ctx.encrypted_password = Some(ciphertext),
            Err(error) => {
                warn!(%error, "password encryption failed");
                return Ok(AuthStep::FetchCipherKey);
            }
        }
        if let Some(sms_code) = ctx.sms_code.as_deref() {
            match crypto::encrypt(sms_code, &public_key) {
                Ok(ciphertext) => ctx.encrypted_sms_code = Some(ciphertext),
                Err(error) => {
                    warn!(%error, "verification code encryption failed");
                    return Ok(AuthStep::FetchCipherKey);
                }
            }
        }

        Ok(AuthStep::HandleCaptcha)
    }

    /// Checks whether a captcha is required and collects the answer.
    async fn step_handle_captcha(
        &mut self,
        ctx: &mut AttemptContext,
    ) -> Result<AuthStep, AuthError> {
        let payload = self.client.need_captcha().await?;
        if !classify::captcha_required(&payload) {
            debug!("captcha waived");
            ctx.captcha_code = None;
            return Ok(AuthStep::PerformLogin);
        }

        let image = self.client.fetch_captcha().await?;
        if image.is_empty() {
            warn!("captcha endpoint returned an empty image");
            return Ok(AuthStep::HandleCaptcha);
        }

        match self.resolver.solve_captcha(&image).await {
            Some(answer) if !answer.trim().is_empty() => {
                ctx.captcha_code = Some(answer.trim().to_string());
                Ok(AuthStep::PerformLogin)
            }
            _ => {
                info!("captcha unanswered, abandoning attempt");
                Ok(AuthStep::Failed)
            }
        }
    }

    /// Submits the login form and routes on the server's verdict.
    async fn step_perform_login(
        &mut self,
        ctx: &mut AttemptContext,
    ) -> Result<AuthStep, AuthError> {
        let Some(password) = ctx.encrypted_password.as_deref() else {
            // Only reachable through a transition bug; restart the
            // encryption cycle instead of submitting garbage.
            warn!("no encrypted password staged, restarting key fetch");
            return Ok(AuthStep::FetchCipherKey);
        };

        let form = LoginForm {
            username: &self.username,
            password,
            service: &ctx.service,
            captcha: ctx.captcha_code.as_deref().unwrap_or(""),
            fingerprint: &self.fingerprint,
            sms_code: ctx.encrypted_sms_code.as_deref(),
        };
        let payload = self.client.cas_login(&form).await?;

        match classify::classify_login(&payload) {
            LoginStatus::Success(success) => {
                if let Err(error) = self
                    .store
                    .save_token(&self.username, &success.tgt, success.max_age)
                    .await
                {
                    // The session itself is fine; only resume is lost.
                    warn!(%error, "could not persist session token");
                }
                self.redirect_url = success.redirect_url;
                Ok(AuthStep::Success)
            }
            LoginStatus::Stage2Required => {
                info!("device not trusted, SMS verification required");
                Ok(AuthStep::HandleStage2)
            }
            LoginStatus::BadCaptcha => {
                warn!("captcha answer rejected");
                ctx.captcha_code = None;
                Ok(AuthStep::HandleCaptcha)
            }
            LoginStatus::BadSmsCode => {
                warn!("verification code rejected");
                ctx.sms_code = None;
                ctx.encrypted_sms_code = None;
                Ok(AuthStep::HandleStage2)
            }
            LoginStatus::CipherError => {
                warn!("server rejected the encryption state, resetting cookies");
                self.client.clear_cookies()?;
                Ok(AuthStep::FetchCipherKey)
            }
            LoginStatus::BadCredentials => {
                error!("username or password rejected");
                Ok(AuthStep::Failed)
            }
            LoginStatus::Failed => {
                warn!(code = ?payload.code, info = ?payload.info, "login rejected");
                Ok(AuthStep::PerformLogin)
            }
        }
    }

    /// Requests an SMS code and collects it from the resolver.
    async fn step_handle_stage2(
        &mut self,
        ctx: &mut AttemptContext,
    ) -> Result<AuthStep, AuthError> {
        let payload = self.client.send_stage2_code(&self.username).await?;

        match classify::classify_sms_dispatch(&payload) {
            SmsDispatchStatus::Sent { phone } => {
                if let Some(phone) = phone {
                    ctx.phone = Some(phone);
                }
                match self
                    .resolver
                    .resolve_sms_code(ctx.phone.as_deref().unwrap_or(""))
                    .await
                {
                    Some(code) if !code.trim().is_empty() => {
                        ctx.sms_code = Some(code.trim().to_string());
                        ctx.encrypted_sms_code = None;
                        // The code must be encrypted under a current key, so
                        // the cycle restarts at the key fetch.
                        Ok(AuthStep::FetchCipherKey)
                    }
                    _ => {
                        info!("verification code unanswered, abandoning attempt");
                        Ok(AuthStep::Failed)
                    }
                }
            }
            SmsDispatchStatus::CipherError => {
                warn!("dispatch rejected the encryption state, resetting cookies");
                self.client.clear_cookies()?;
                Ok(AuthStep::FetchCipherKey)
            }
            SmsDispatchStatus::RateLimited => {
                warn!(cooldown_secs = self.sms_cooldown.as_secs(), "SMS dispatch rate-limited, waiting");
                tokio::time::sleep(self.sms_cooldown).await;
                Ok(AuthStep::HandleStage2)
            }
            SmsDispatchStatus::Failed => {
                warn!(code = ?payload.code, "SMS dispatch failed");
                Ok(AuthStep::HandleStage2)
            }
        }
    }
}
