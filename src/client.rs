//! HTTP transport for the CAS login backend.
//!
//! [`AuthClient`] wraps one [`reqwest::Client`] with the service's fixed
//! headers and a managed cookie jar, and exposes one method per backend
//! endpoint. Methods return the raw [`CasPayload`] (or image bytes) without
//! interpreting it; classification lives in [`crate::protocol`] and
//! orchestration in [`crate::manager`]. No retry logic here either.
//!
//! The transport must be opened before use and can be closed and reopened;
//! dropping it releases the connection pool and jar.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::protocol::{CasPayload, TGT_COOKIE};

/// Production base of the login backend.
pub const DEFAULT_BASE_URL: &str = "https://auth.seu.edu.cn/auth/casback/";

const ORIGIN_VALUE: &str = "https://auth.seu.edu.cn/";
const REFERER_VALUE: &str = "https://auth.seu.edu.cn/dist/";

/// Browser-like User-Agent; the backend rejects obviously non-browser
/// clients.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// Endpoint names, exactly as they appear on the wire. "Chiper" is the
// backend's own spelling.
const EP_VERIFY_TGT: &str = "verifyTgt";
const EP_NEED_CAPTCHA: &str = "needCaptcha";
const EP_GET_CAPTCHA: &str = "getCaptcha";
const EP_GET_CIPHER_KEY: &str = "getChiperKey";
const EP_CAS_LOGIN: &str = "casLogin";
const EP_SEND_STAGE2_CODE: &str = "sendStage2Code";
const EP_CAS_LOGOUT: &str = "casLogout";

/// Errors from the HTTP transport.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation attempted before `open()` or after `close()`.
    #[error("transport is not open")]
    NotOpen,

    /// The base URL or the underlying HTTP client could not be built.
    #[error("failed to build HTTP transport: {reason}")]
    Build {
        /// What went wrong.
        reason: String,
    },

    /// The server answered outside the 2xx range.
    #[error("{operation} failed with HTTP status {status}")]
    HttpStatus {
        /// Endpoint name.
        operation: &'static str,
        /// HTTP status code received.
        status: u16,
    },

    /// The request timed out.
    #[error("{operation} timed out")]
    Timeout {
        /// Endpoint name.
        operation: &'static str,
    },

    /// Connection-level failure.
    #[error("{operation} failed: {source}")]
    Network {
        /// Endpoint name.
        operation: &'static str,
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body was not the expected JSON envelope.
    #[error("{operation} returned an undecodable body: {source}")]
    Decode {
        /// Endpoint name.
        operation: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

// Constructors carry the endpoint context explicitly; blanket From impls
// would lose which operation failed.
impl ClientError {
    /// Creates a build error.
    pub fn build(reason: impl Into<String>) -> Self {
        Self::Build {
            reason: reason.into(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(operation: &'static str, status: u16) -> Self {
        Self::HttpStatus { operation, status }
    }

    /// Wraps a reqwest send error, separating timeouts from other network
    /// failures.
    pub fn request(operation: &'static str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { operation }
        } else {
            Self::Network { operation, source }
        }
    }

    /// Creates a body-decoding error.
    pub fn decode(operation: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { operation, source }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Service base URL. A trailing slash is added if missing so that
    /// endpoint names join beneath the full path.
    pub base_url: String,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Extra headers merged over the defaults; a matching name replaces
    /// the default value. Overriding `Origin` or `Referer` will usually
    /// break the login.
    pub headers: HeaderMap,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            headers: HeaderMap::new(),
        }
    }
}

/// One `casLogin` submission.
///
/// `password` and `sms_code` carry RSA ciphertext, never raw secrets.
#[derive(Clone)]
pub struct LoginForm<'a> {
    /// Account identifier (student card number).
    pub username: &'a str,
    /// RSA-encrypted password, base64.
    pub password: &'a str,
    /// Post-login service URL; empty when none.
    pub service: &'a str,
    /// Captcha answer; empty when no captcha was required.
    pub captcha: &'a str,
    /// Device fingerprint.
    pub fingerprint: &'a str,
    /// RSA-encrypted SMS code during second-factor verification.
    pub sms_code: Option<&'a str>,
}

/// Wire layout of the `casLogin` body. The constant fields mimic the
/// browser front end and are required verbatim.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CasLoginBody<'a> {
    service: &'a str,
    username: &'a str,
    password: &'a str,
    captcha: &'a str,
    remember_me: bool,
    login_type: &'a str,
    wx_binded: bool,
    mobile_phone_num: &'a str,
    finger_print: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mobile_verify_code: Option<&'a str>,
}

impl<'a> From<&LoginForm<'a>> for CasLoginBody<'a> {
    fn from(form: &LoginForm<'a>) -> Self {
        Self {
            service: form.service,
            username: form.username,
            password: form.password,
            captcha: form.captcha,
            remember_me: true,
            login_type: "account",
            wx_binded: false,
            mobile_phone_num: "",
            finger_print: form.fingerprint,
            mobile_verify_code: form.sms_code,
        }
    }
}

struct HttpState {
    client: reqwest::Client,
    jar: Arc<Jar>,
    base: Url,
}

/// HTTP client bound to the login service.
pub struct AuthClient {
    options: ClientOptions,
    state: Option<HttpState>,
}

impl fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthClient")
            .field("base_url", &self.options.base_url)
            .field("open", &self.state.is_some())
            .finish()
    }
}

impl Default for AuthClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthClient {
    /// Creates a closed client with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ClientOptions::default())
    }

    /// Creates a closed client with custom options.
    #[must_use]
    pub fn with_options(options: ClientOptions) -> Self {
        Self {
            options,
            state: None,
        }
    }

    /// Whether the transport is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Opens the transport: validates the base URL and builds the cookie
    /// jar and the underlying client. Reopening an open client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Build`] when the base URL does not parse or
    /// the HTTP client cannot be constructed.
    pub fn open(&mut self) -> Result<(), ClientError> {
        if self.state.is_some() {
            return Ok(());
        }
        let base = parse_base(&self.options.base_url)?;
        let jar = Arc::new(Jar::default());
        let client = build_client(&self.options, Arc::clone(&jar))?;
        debug!(base = %base, "transport opened");
        self.state = Some(HttpState { client, jar, base });
        Ok(())
    }

    /// Closes the transport, dropping the connection pool and every cookie.
    pub fn close(&mut self) {
        if self.state.take().is_some() {
            debug!("transport closed");
        }
    }

    fn state(&self) -> Result<&HttpState, ClientError> {
        self.state.as_ref().ok_or(ClientError::NotOpen)
    }

    // ========== Cookie management ==========

    /// Exports the cookies currently visible to the service origin.
    pub fn cookies(&self) -> Result<HashMap<String, String>, ClientError> {
        let state = self.state()?;
        let Some(header) = state.jar.cookies(&state.base) else {
            return Ok(HashMap::new());
        };
        match header.to_str() {
            Ok(raw) => Ok(parse_cookie_header(raw)),
            Err(_) => Ok(HashMap::new()),
        }
    }

    /// Reads one cookie by name.
    pub fn cookie(&self, name: &str) -> Result<Option<String>, ClientError> {
        Ok(self.cookies()?.remove(name))
    }

    /// Current ticket-granting token, if the jar holds one.
    pub fn tgt(&self) -> Result<Option<String>, ClientError> {
        self.cookie(TGT_COOKIE)
    }

    /// Imports cookies into the live jar, scoped to the service origin.
    pub fn load_cookies<'a>(
        &self,
        cookies: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), ClientError> {
        let state = self.state()?;
        for (name, value) in cookies {
            state
                .jar
                .add_cookie_str(&format!("{name}={value}; Path=/"), &state.base);
        }
        Ok(())
    }

    /// Inserts one cookie scoped to the service origin.
    pub fn set_cookie(&self, name: &str, value: &str) -> Result<(), ClientError> {
        self.load_cookies([(name, value)])
    }

    /// Drops one cookie by expiring it at the service origin.
    pub fn remove_cookie(&self, name: &str) -> Result<(), ClientError> {
        let state = self.state()?;
        state
            .jar
            .add_cookie_str(&format!("{name}=; Path=/; Max-Age=0"), &state.base);
        Ok(())
    }

    /// Drops every cookie by rebuilding the jar and the client around it.
    /// The connection pool is rebuilt too, which is acceptable for how
    /// rarely desync recovery runs.
    pub fn clear_cookies(&mut self) -> Result<(), ClientError> {
        let base = self.state()?.base.clone();
        let jar = Arc::new(Jar::default());
        let client = build_client(&self.options, Arc::clone(&jar))?;
        self.state = Some(HttpState { client, jar, base });
        debug!("cookie jar cleared");
        Ok(())
    }

    /// Live handle to the underlying HTTP client, carrying the session
    /// cookies. Meant for use after a successful login.
    pub fn http_client(&self) -> Result<reqwest::Client, ClientError> {
        Ok(self.state()?.client.clone())
    }

    // ========== Endpoints ==========

    /// Probes whether a token is still accepted.
    ///
    /// With an explicit `tgt` the probe runs on a one-shot client carrying
    /// only that token, leaving the live jar untouched; with `None` it
    /// rides the live session's cookies. `service` is forwarded so the
    /// answer can include a service-specific redirect.
    #[instrument(skip_all, fields(explicit_token = tgt.is_some()))]
    pub async fn verify_tgt(
        &self,
        tgt: Option<&str>,
        service: Option<&str>,
    ) -> Result<CasPayload, ClientError> {
        let mut body = serde_json::Map::new();
        if let Some(service) = service {
            body.insert("service".to_string(), serde_json::Value::from(service));
        }

        let Some(token) = tgt else {
            return self.post_json(EP_VERIFY_TGT, &body).await;
        };

        let state = self.state()?;
        let jar = Arc::new(Jar::default());
        jar.add_cookie_str(&format!("{TGT_COOKIE}={token}; Path=/"), &state.base);
        let scratch = build_client(&self.options, jar)?;
        let url = endpoint_url(&state.base, EP_VERIFY_TGT)?;
        execute_json(EP_VERIFY_TGT, scratch.post(url).json(&body)).await
    }

    /// Asks whether the login must include a captcha answer.
    #[instrument(skip(self))]
    pub async fn need_captcha(&self) -> Result<CasPayload, ClientError> {
        self.get_json(EP_NEED_CAPTCHA).await
    }

    /// Fetches the captcha image bytes.
    #[instrument(skip(self))]
    pub async fn fetch_captcha(&self) -> Result<Vec<u8>, ClientError> {
        let state = self.state()?;
        let url = endpoint_url(&state.base, EP_GET_CAPTCHA)?;
        let response = state
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ClientError::request(EP_GET_CAPTCHA, source))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::http_status(EP_GET_CAPTCHA, status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ClientError::request(EP_GET_CAPTCHA, source))?;
        debug!(size = bytes.len(), "captcha image fetched");
        Ok(bytes.to_vec())
    }

    /// Fetches the RSA public key for credential encryption.
    ///
    /// A fresh key arrives together with the correlation cookie, which the
    /// jar captures automatically; later requests must keep sending it.
    #[instrument(skip(self))]
    pub async fn fetch_cipher_key(&self) -> Result<CasPayload, ClientError> {
        self.post_json(EP_GET_CIPHER_KEY, &serde_json::json!({})).await
    }

    /// Submits the login form.
    #[instrument(skip_all, fields(username = form.username))]
    pub async fn cas_login(&self, form: &LoginForm<'_>) -> Result<CasPayload, ClientError> {
        self.post_json(EP_CAS_LOGIN, &CasLoginBody::from(form)).await
    }

    /// Requests an SMS verification code for second-factor login.
    #[instrument(skip(self))]
    pub async fn send_stage2_code(&self, username: &str) -> Result<CasPayload, ClientError> {
        self.post_json(EP_SEND_STAGE2_CODE, &serde_json::json!({ "userId": username }))
            .await
    }

    /// Invalidates the current session server-side.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<CasPayload, ClientError> {
        self.post_json(EP_CAS_LOGOUT, &serde_json::json!({})).await
    }

    async fn post_json(
        &self,
        operation: &'static str,
        body: &impl Serialize,
    ) -> Result<CasPayload, ClientError> {
        let state = self.state()?;
        let url = endpoint_url(&state.base, operation)?;
        execute_json(operation, state.client.post(url).json(body)).await
    }

    async fn get_json(&self, operation: &'static str) -> Result<CasPayload, ClientError> {
        let state = self.state()?;
        let url = endpoint_url(&state.base, operation)?;
        execute_json(operation, state.client.get(url)).await
    }
}

/// Sends a prepared request and decodes the JSON envelope.
async fn execute_json(
    operation: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<CasPayload, ClientError> {
    let response = request
        .send()
        .await
        .map_err(|source| ClientError::request(operation, source))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::http_status(operation, status.as_u16()));
    }
    let body = response
        .text()
        .await
        .map_err(|source| ClientError::request(operation, source))?;
    let payload: CasPayload =
        serde_json::from_str(&body).map_err(|source| ClientError::decode(operation, source))?;
    debug!(operation, ?payload, "endpoint answered");
    Ok(payload)
}

/// Validates the configured base URL, normalizing the trailing slash.
fn parse_base(raw: &str) -> Result<Url, ClientError> {
    let mut normalized = raw.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized)
        .map_err(|error| ClientError::build(format!("invalid base URL {raw:?}: {error}")))
}

fn endpoint_url(base: &Url, endpoint: &'static str) -> Result<Url, ClientError> {
    base.join(endpoint)
        .map_err(|error| ClientError::build(format!("cannot resolve endpoint {endpoint}: {error}")))
}

/// Default headers merged with the caller's overrides.
fn request_headers(options: &ClientOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ORIGIN, HeaderValue::from_static(ORIGIN_VALUE));
    headers.insert(REFERER, HeaderValue::from_static(REFERER_VALUE));
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    for (name, value) in &options.headers {
        headers.insert(name.clone(), value.clone());
    }
    headers
}

fn build_client(options: &ClientOptions, jar: Arc<Jar>) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .default_headers(request_headers(options))
        .timeout(options.timeout)
        .gzip(true)
        .cookie_provider(jar)
        .build()
        .map_err(|error| ClientError::build(error.to_string()))
}

/// Splits a `Cookie` header line into name/value pairs.
fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
