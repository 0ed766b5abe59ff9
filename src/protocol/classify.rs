//! Outcome classification for CAS backend responses.
//!
//! The backend multiplexes many outcomes over HTTP 200 answers, signalling
//! them through application-level status codes and notice text (mostly
//! Chinese). Each classifier here reduces a raw [`CasPayload`] to a closed
//! enum the orchestrator can branch on. All functions are pure; transport
//! failures never reach them.
//!
//! Status codes alone are not trustworthy (the same code is reused for
//! unrelated conditions), so classification combines codes with notice
//! markers in a fixed precedence order.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::CasPayload;

/// Application code signalling that second-factor verification is required.
const CODE_STAGE2_REQUIRED: i64 = 502;

/// Application code for rejected username/password pairs.
const CODE_BAD_CREDENTIALS: i64 = 402;

/// Application codes for rejected captcha answers.
const CODES_BAD_CAPTCHA: [i64; 2] = [4000, 4001];

/// Application code for rejected SMS verification codes.
const CODE_BAD_SMS_CODE: i64 = 503;

/// Application code for an SMS dispatch rejected due to a stale cipher key.
const CODE_SMS_KEY_EXPIRED: i64 = 5002;

/// Application code for an SMS dispatch rejected by rate limiting.
const CODE_SMS_RATE_LIMITED: i64 = 5001;

/// Lowercased marker present when a previously issued key is returned again.
const KEY_REUSED_MARKER: &str = "reuse";

/// Marker in the captcha-gate notice when no captcha is needed. 不需要 = "not required".
const CAPTCHA_WAIVED_MARKER: &str = "不需要";

/// Markers (all required) for untrusted-device notices. 设备 = "device", 验证 = "verification".
const STAGE2_MARKERS: [&str; 2] = ["设备", "验证"];

/// Markers (any) for credential rejections. 用户名 = "username", 密码 = "password".
const CREDENTIAL_MARKERS: [&str; 2] = ["用户名", "密码"];

/// Marker naming a verification code. 验证码 = "captcha / verification code".
const VERIFICATION_CODE_MARKER: &str = "验证码";

/// Markers (any) for a stale or desynchronized cipher key.
/// 过期 = "expired", 失效 = "invalidated", 刷新 = "refresh".
const CIPHER_DESYNC_MARKERS: [&str; 3] = ["过期", "失效", "刷新"];

/// Markers (any) for SMS rate limiting. 过多 = "too many", 重试 = "retry".
const RATE_LIMIT_MARKERS: [&str; 2] = ["过多", "重试"];

/// Markers (all required) in the English already-logged-out notice.
const ALREADY_LOGGED_OUT_MARKERS: [&str; 2] = ["not", "log"];

/// Matches the first run of 11 digits (a mainland mobile number).
#[allow(clippy::expect_used)]
static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{11}").expect("phone regex is valid")
});

/// Outcome of a cipher-key fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherKeyStatus {
    /// A fresh key was issued; the correlation cookie accompanies it.
    Issued {
        /// Encoded public key exactly as sent by the server.
        public_key: String,
    },

    /// A previously issued key was returned again. No correlation cookie
    /// accompanies a reused key, so the cached one must still be on hand.
    Reused {
        /// Encoded public key exactly as sent by the server.
        public_key: String,
    },

    /// Missing, empty, or unsuccessful key response.
    Failed,
}

/// Successful login details extracted from a `casLogin` response.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    /// Ticket-granting token value.
    pub tgt: String,

    /// Token lifetime in seconds; non-positive means no time-based expiry.
    pub max_age: i64,

    /// Percent-decoded post-login redirect, when the server supplied one.
    pub redirect_url: Option<String>,
}

// The token is a session credential; keep it out of logs.
impl fmt::Debug for LoginSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginSuccess")
            .field("tgt", &"<redacted>")
            .field("max_age", &self.max_age)
            .field("redirect_url", &self.redirect_url)
            .finish()
    }
}

/// Outcome of a `casLogin` submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStatus {
    /// Login accepted and a token issued.
    Success(LoginSuccess),

    /// The device is not trusted; SMS second-factor verification required.
    Stage2Required,

    /// Username/password pair rejected. Retrying cannot help.
    BadCredentials,

    /// Captcha answer rejected; a fresh captcha must be fetched.
    BadCaptcha,

    /// SMS verification code rejected; a fresh code must be requested.
    BadSmsCode,

    /// The cipher key used for encryption is stale; the key exchange must
    /// restart from scratch.
    CipherError,

    /// Any other rejection.
    Failed,
}

/// Outcome of a `sendStage2Code` dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsDispatchStatus {
    /// Code sent to the user's phone.
    Sent {
        /// Phone number parsed from the notice, when present.
        phone: Option<String>,
    },

    /// Dispatch rejected because the cipher key is stale.
    CipherError,

    /// Dispatch rejected by rate limiting; wait before retrying.
    RateLimited,

    /// Any other rejection.
    Failed,
}

/// Outcome of probing an existing token with `verifyTgt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionVerdict {
    /// The token is still accepted.
    Valid {
        /// Redirect target reported alongside the verification, as sent.
        redirect_url: Option<String>,
    },

    /// The token is expired, revoked, or unknown.
    Invalid,
}

/// Classifies a `getChiperKey` response.
///
/// Success requires a 2xx application code, the success flag, and a
/// non-empty key. A notice mentioning reuse downgrades the outcome to
/// [`CipherKeyStatus::Reused`], which callers must treat specially because
/// no correlation cookie accompanies a reused key.
#[must_use]
pub fn classify_cipher_key(payload: &CasPayload) -> CipherKeyStatus {
    let public_key = payload
        .public_key
        .as_deref()
        .filter(|key| !key.is_empty());

    let Some(public_key) = public_key else {
        return CipherKeyStatus::Failed;
    };
    if !(payload.has_success_code() && payload.flagged_success()) {
        return CipherKeyStatus::Failed;
    }

    let public_key = public_key.to_string();
    if payload.notice_lowered().contains(KEY_REUSED_MARKER) {
        CipherKeyStatus::Reused { public_key }
    } else {
        CipherKeyStatus::Issued { public_key }
    }
}

/// Whether the login flow must solve a captcha.
///
/// The gate is waived only by an explicit 2xx "not required" notice.
/// Anything ambiguous, including an empty payload, requires the captcha;
/// submitting a spurious answer is harmless while skipping a required one
/// fails the login.
#[must_use]
pub fn captcha_required(payload: &CasPayload) -> bool {
    !(payload.has_success_code()
        && payload
            .info
            .as_deref()
            .unwrap_or("")
            .contains(CAPTCHA_WAIVED_MARKER))
}

/// Classifies a `verifyTgt` probe of an existing token.
///
/// The redirect is passed through exactly as sent; unlike login responses
/// it is not percent-encoded.
#[must_use]
pub fn classify_verify_tgt(payload: &CasPayload) -> SessionVerdict {
    if payload.has_success_code() && payload.flagged_success() {
        SessionVerdict::Valid {
            redirect_url: payload
                .redirect_url
                .clone()
                .filter(|url| !url.is_empty()),
        }
    } else {
        SessionVerdict::Invalid
    }
}

/// Classifies a `casLogin` response.
///
/// Precedence (first match wins):
///
/// | Check | Outcome |
/// |-------|---------|
/// | 2xx + success flag + non-empty token | `Success` |
/// | code 502, nominal stage-2 flag, or device+verification notice | `Stage2Required` |
/// | code 402 or username/password notice | `BadCredentials` |
/// | code 4000/4001 with verification-code notice | `BadCaptcha` |
/// | code 503 with verification-code notice | `BadSmsCode` |
/// | expired/invalidated/refresh notice | `CipherError` |
/// | anything else | `Failed` |
///
/// The nominal `needStage2Validation` flag is observed always-false
/// upstream; code 502 and the notice text carry the real signal, but the
/// flag stays in the disjunction in case the server ever starts setting it.
#[must_use]
pub fn classify_login(payload: &CasPayload) -> LoginStatus {
    let notice = payload.notice_lowered();

    if payload.has_success_code()
        && payload.flagged_success()
        && let Some(tgt) = payload.tgt_cookie.as_deref().filter(|t| !t.is_empty())
    {
        return LoginStatus::Success(LoginSuccess {
            tgt: tgt.to_string(),
            max_age: payload.max_age.unwrap_or(0),
            redirect_url: decode_redirect(payload.redirect_url.as_deref()),
        });
    }

    if payload.code == Some(CODE_STAGE2_REQUIRED)
        || payload.need_stage2_validation.unwrap_or(false)
        || STAGE2_MARKERS.iter().all(|marker| notice.contains(marker))
    {
        return LoginStatus::Stage2Required;
    }

    if payload.code == Some(CODE_BAD_CREDENTIALS) || contains_any(&notice, &CREDENTIAL_MARKERS) {
        return LoginStatus::BadCredentials;
    }

    if payload.code.is_some_and(|code| CODES_BAD_CAPTCHA.contains(&code))
        && notice.contains(VERIFICATION_CODE_MARKER)
    {
        return LoginStatus::BadCaptcha;
    }

    if payload.code == Some(CODE_BAD_SMS_CODE) && notice.contains(VERIFICATION_CODE_MARKER) {
        return LoginStatus::BadSmsCode;
    }

    if contains_any(&notice, &CIPHER_DESYNC_MARKERS) {
        return LoginStatus::CipherError;
    }

    LoginStatus::Failed
}

/// Classifies a `sendStage2Code` response.
#[must_use]
pub fn classify_sms_dispatch(payload: &CasPayload) -> SmsDispatchStatus {
    let notice = payload.notice_lowered();

    if payload.has_success_code() && payload.flagged_success() {
        return SmsDispatchStatus::Sent {
            phone: extract_phone(payload.info.as_deref().unwrap_or("")),
        };
    }

    if payload.code == Some(CODE_SMS_KEY_EXPIRED) || contains_any(&notice, &CIPHER_DESYNC_MARKERS)
    {
        return SmsDispatchStatus::CipherError;
    }

    if payload.code == Some(CODE_SMS_RATE_LIMITED) || contains_any(&notice, &RATE_LIMIT_MARKERS) {
        return SmsDispatchStatus::RateLimited;
    }

    SmsDispatchStatus::Failed
}

/// Whether a `casLogout` response means the session is gone.
///
/// Logging out an already logged-out session answers with a "not logged in"
/// notice; that counts as success since the desired end state holds.
#[must_use]
pub fn logout_succeeded(payload: &CasPayload) -> bool {
    if payload.has_success_code() && payload.flagged_success() {
        return true;
    }
    let notice = payload.notice_lowered();
    ALREADY_LOGGED_OUT_MARKERS
        .iter()
        .all(|marker| notice.contains(marker))
}

/// Percent-decodes a login redirect, treating empty values as absent.
fn decode_redirect(raw: Option<&str>) -> Option<String> {
    let raw = raw.filter(|url| !url.is_empty())?;
    match urlencoding::decode(raw) {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(error) => {
            debug!(%error, "redirect URL is not UTF-8 after decoding, keeping raw form");
            Some(raw.to_string())
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn extract_phone(notice: &str) -> Option<String> {
    PHONE_PATTERN
        .find(notice)
        .map(|found| found.as_str().to_string())
}
