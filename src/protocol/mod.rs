//! Wire-level types and response interpretation for the CAS backend.
//!
//! Every JSON endpoint of the login service answers with the same loose
//! envelope; [`CasPayload`] captures it with all fields optional so that
//! partial or malformed answers deserialize instead of erroring. The
//! [`classify`] submodule turns raw payloads into closed outcome enums;
//! nothing in this module performs I/O.

use std::fmt;

use serde::Deserialize;

pub mod classify;

pub use classify::{
    CipherKeyStatus, LoginStatus, LoginSuccess, SessionVerdict, SmsDispatchStatus,
    captcha_required, classify_cipher_key, classify_login, classify_sms_dispatch,
    classify_verify_tgt, logout_succeeded,
};

/// Cookie holding the ticket-granting token of an authenticated session.
pub const TGT_COOKIE: &str = "TGT";

/// Cookie correlating the issued cipher key with the login session.
///
/// The upstream service misspells "cipher" in the cookie name; the literal
/// must match the wire exactly.
pub const CORRELATION_COOKIE: &str = "CHIPER_UID";

/// Response envelope shared by all JSON endpoints of the CAS backend.
///
/// Fields are populated opportunistically by the server depending on the
/// endpoint and outcome, so all of them are optional here. Interpretation
/// lives in [`classify`]; this type is a faithful carrier.
#[derive(Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CasPayload {
    /// Application-level status code (not the HTTP status).
    pub code: Option<i64>,
    /// Human-readable notice, usually in Chinese.
    pub info: Option<String>,
    /// Coarse success flag.
    pub success: Option<bool>,
    /// RSA public key for credential encryption (base64 or base64url SPKI).
    pub public_key: Option<String>,
    /// Ticket-granting token issued on successful login.
    pub tgt_cookie: Option<String>,
    /// Service ticket, present on some login responses.
    pub st_cookie: Option<String>,
    /// Post-login redirect target, percent-encoded on login responses.
    pub redirect_url: Option<String>,
    /// Token lifetime in seconds; non-positive means no time-based expiry.
    pub max_age: Option<i64>,
    /// Nominal second-factor flag. Observed always-false upstream, so
    /// callers must not rely on it alone.
    pub need_stage2_validation: Option<bool>,
}

impl CasPayload {
    /// Whether the application-level status code is in the 2xx range.
    #[must_use]
    pub fn has_success_code(&self) -> bool {
        self.code.is_some_and(|code| (200..300).contains(&code))
    }

    /// Whether the server flagged the operation as successful.
    #[must_use]
    pub fn flagged_success(&self) -> bool {
        self.success.unwrap_or(false)
    }

    /// Notice text lowercased for marker matching; empty when absent.
    pub(crate) fn notice_lowered(&self) -> String {
        self.info.as_deref().unwrap_or("").to_lowercase()
    }
}

// Tokens are session credentials; keep them out of logs.
impl fmt::Debug for CasPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasPayload")
            .field("code", &self.code)
            .field("info", &self.info)
            .field("success", &self.success)
            .field("public_key", &self.public_key.as_deref().map(|_| "<present>"))
            .field("tgt_cookie", &self.tgt_cookie.as_deref().map(|_| "<redacted>"))
            .field("st_cookie", &self.st_cookie.as_deref().map(|_| "<redacted>"))
            .field("redirect_url", &self.redirect_url)
            .field("max_age", &self.max_age)
            .field("need_stage2_validation", &self.need_stage2_validation)
            .finish()
    }
}
