//! Shared utilities for the login integration tests: a disposable RSA
//! keypair matching the backend's key format, canned response payloads,
//! and scripted resolver/store doubles that record what they were asked.

// Each test binary compiles this module and none of them uses every helper.
#![allow(dead_code)]

pub mod socket_guard;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use seu_auth::{ChallengeResolver, MemoryStore, SessionStore, StoreError};
use serde_json::json;
use wiremock::ResponseTemplate;

/// Routes library tracing to the test writer, honoring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("seu_auth=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// RSA keypair standing in for the backend's login key.
///
/// The public half is exposed the way `getChiperKey` serves it (base64
/// SPKI DER); the private half decrypts what the client submitted.
pub struct TestKey {
    private: RsaPrivateKey,
    public_b64: String,
}

impl TestKey {
    /// Generates a fresh 1024-bit keypair. Small on purpose; these tests
    /// only need the round trip, not production strength.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).expect("generate test RSA key");
        let der = private
            .to_public_key()
            .to_public_key_der()
            .expect("encode test key as SPKI");
        let public_b64 = STANDARD.encode(der.as_bytes());
        Self {
            private,
            public_b64,
        }
    }

    /// The key as served by the backend.
    pub fn public_b64(&self) -> &str {
        &self.public_b64
    }

    /// Decrypts a base64 ciphertext produced by the client under this key.
    pub fn decrypt(&self, ciphertext_b64: &str) -> String {
        let ciphertext = STANDARD
            .decode(ciphertext_b64)
            .expect("ciphertext should be base64");
        let plaintext = self
            .private
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .expect("ciphertext should decrypt under the test key");
        String::from_utf8(plaintext).expect("plaintext should be UTF-8")
    }
}

/// Plain backend envelope with no extra fields.
pub fn envelope(code: i64, info: &str, success: bool) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "code": code,
        "info": info,
        "success": success,
    }))
}

/// `getChiperKey` response. `correlation` controls whether the response
/// sets the `CHIPER_UID` cookie, as a fresh key issue would.
pub fn cipher_key_response(
    public_key: &str,
    correlation: Option<&str>,
    reused: bool,
) -> ResponseTemplate {
    let info = if reused { "public key is reused" } else { "" };
    let mut template = ResponseTemplate::new(200).set_body_json(json!({
        "code": 200,
        "info": info,
        "success": true,
        "publicKey": public_key,
    }));
    if let Some(correlation) = correlation {
        template = template.insert_header("Set-Cookie", format!("CHIPER_UID={correlation}; Path=/"));
    }
    template
}

/// `needCaptcha` answer saying no captcha is required.
pub fn captcha_waived() -> ResponseTemplate {
    envelope(200, "不需要验证码", true)
}

/// `needCaptcha` answer demanding a captcha.
pub fn captcha_demanded() -> ResponseTemplate {
    envelope(4000, "需要验证码", true)
}

/// Successful `casLogin` response issuing `tgt`.
pub fn login_success(tgt: &str, max_age: i64, redirect_url: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Set-Cookie", format!("TGT={tgt}; Path=/"))
        .set_body_json(json!({
            "code": 200,
            "info": "登录成功",
            "success": true,
            "tgtCookie": tgt,
            "maxAge": max_age,
            "redirectUrl": redirect_url,
        }))
}

/// `casLogin` response demanding SMS second-factor verification.
pub fn stage2_demanded() -> ResponseTemplate {
    envelope(502, "非可信设备，需要二次验证", false)
}

/// Challenge resolver with canned answers.
///
/// Answers are consumed front to back; an exhausted queue answers `None`,
/// which the orchestrator treats as giving up. Every call is counted so
/// tests can assert how often a challenge was posed.
#[derive(Default)]
pub struct ScriptedResolver {
    captcha_answers: Mutex<VecDeque<Option<String>>>,
    sms_answers: Mutex<VecDeque<Option<String>>>,
    captcha_calls: AtomicUsize,
    sms_calls: AtomicUsize,
    phones: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_captcha(&self, answer: &str) {
        self.captcha_answers
            .lock()
            .expect("captcha queue lock")
            .push_back(Some(answer.to_string()));
    }

    /// Scripts a refused captcha (the user walking away).
    pub fn refuse_captcha(&self) {
        self.captcha_answers
            .lock()
            .expect("captcha queue lock")
            .push_back(None);
    }

    pub fn push_sms(&self, code: &str) {
        self.sms_answers
            .lock()
            .expect("sms queue lock")
            .push_back(Some(code.to_string()));
    }

    pub fn captcha_calls(&self) -> usize {
        self.captcha_calls.load(Ordering::SeqCst)
    }

    pub fn sms_calls(&self) -> usize {
        self.sms_calls.load(Ordering::SeqCst)
    }

    /// Phone numbers the resolver was told the code went to.
    pub fn phones(&self) -> Vec<String> {
        self.phones.lock().expect("phone log lock").clone()
    }
}

#[async_trait]
impl ChallengeResolver for ScriptedResolver {
    async fn solve_captcha(&self, _image: &[u8]) -> Option<String> {
        self.captcha_calls.fetch_add(1, Ordering::SeqCst);
        self.captcha_answers
            .lock()
            .expect("captcha queue lock")
            .pop_front()
            .flatten()
    }

    async fn resolve_sms_code(&self, phone: &str) -> Option<String> {
        self.sms_calls.fetch_add(1, Ordering::SeqCst);
        self.phones
            .lock()
            .expect("phone log lock")
            .push(phone.to_string());
        self.sms_answers
            .lock()
            .expect("sms queue lock")
            .pop_front()
            .flatten()
    }
}

/// In-memory session store that logs every `save_token` call.
///
/// Storage itself is delegated to a [`MemoryStore`]; the log keeps the
/// exact arguments so tests can assert on token values and expiry.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    saved_tokens: Mutex<Vec<(String, String, i64)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(username, token, max_age)` triples in the order they were saved.
    pub fn saved_tokens(&self) -> Vec<(String, String, i64)> {
        self.saved_tokens.lock().expect("save log lock").clone()
    }
}

#[async_trait]
impl SessionStore for RecordingStore {
    async fn load_token(&self, username: &str) -> Result<Option<String>, StoreError> {
        self.inner.load_token(username).await
    }

    async fn save_token(
        &self,
        username: &str,
        token: &str,
        max_age: i64,
    ) -> Result<(), StoreError> {
        self.saved_tokens
            .lock()
            .expect("save log lock")
            .push((username.to_string(), token.to_string(), max_age));
        self.inner.save_token(username, token, max_age).await
    }

    async fn load_fingerprint(&self) -> Result<Option<String>, StoreError> {
        self.inner.load_fingerprint().await
    }

    async fn save_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.inner.save_fingerprint(fingerprint).await
    }

    async fn load_correlation(&self, key_fingerprint: &str) -> Result<Option<String>, StoreError> {
        self.inner.load_correlation(key_fingerprint).await
    }

    async fn save_correlation(&self, key_fingerprint: &str, cookie: &str) -> Result<(), StoreError> {
        self.inner.save_correlation(key_fingerprint, cookie).await
    }
}
