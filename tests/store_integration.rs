//! Integration tests for session persistence.
//!
//! These tests run full logins through AuthManager backed by a JsonFileStore
//! in a temp directory, then verify what landed on disk and that a second
//! manager (standing in for a process restart) picks the state back up.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use seu_auth::{AuthManager, JsonFileStore};
use tempfile::TempDir;
use wiremock::matchers::{header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};
use support::{ScriptedResolver, TestKey};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

const USERNAME: &str = "220230001";
const PASSWORD: &str = "sup3r-secret#pw";
const SERVICE: &str = "https://ehall.seu.edu.cn/";

// ==================== Helper Functions ====================

fn manager_for(server: &MockServer, store_path: &Path) -> AuthManager {
    support::init_tracing();
    AuthManager::builder(USERNAME, PASSWORD)
        .base_url(server.uri())
        .resolver(Arc::new(ScriptedResolver::new()))
        .store(Arc::new(JsonFileStore::new(store_path)))
        .build()
}

async fn mount_cipher_key(server: &MockServer, key: &TestKey) {
    Mock::given(method("POST"))
        .and(path("/getChiperKey"))
        .respond_with(support::cipher_key_response(key.public_b64(), Some("uid-1"), false))
        .mount(server)
        .await;
}

async fn mount_captcha_waived(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/needCaptcha"))
        .respond_with(support::captcha_waived())
        .mount(server)
        .await;
}

fn read_document(store_path: &Path) -> Value {
    let raw = std::fs::read_to_string(store_path).expect("store file should exist");
    serde_json::from_str(&raw).expect("store file should be JSON")
}

/// Decoded bodies of every `casLogin` submission, in order.
async fn cas_login_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/casLogin")
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

// ==================== Persistence Tests ====================

#[tokio::test]
async fn test_login_persists_session_state_to_file() {
    let mock_server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("auth_session.json");

    let key = TestKey::generate();
    mount_cipher_key(&mock_server, &key).await;
    mount_captcha_waived(&mock_server).await;
    Mock::given(method("POST"))
        .and(path("/casLogin"))
        .respond_with(support::login_success("TGT-1-file", -1, ""))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut manager = manager_for(&mock_server, &store_path);
    manager
        .login(false, SERVICE)
        .await
        .expect("login should not error")
        .expect("login should succeed");

    let document = read_document(&store_path);
    assert_eq!(document["tokens"][USERNAME]["value"], "TGT-1-file");
    assert!(
        document["tokens"][USERNAME]["expires_at"].is_null(),
        "a non-positive maxAge means no expiry"
    );
    assert_eq!(document["fingerprint"].as_str().unwrap().len(), 32);

    let correlations = document["correlations"].as_object().unwrap();
    assert_eq!(correlations.len(), 1);
    assert!(correlations.values().all(|value| value == "uid-1"));
}

#[tokio::test]
async fn test_second_manager_resumes_from_persisted_token() {
    let mock_server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("auth_session.json");

    let key = TestKey::generate();
    mount_cipher_key(&mock_server, &key).await;
    mount_captcha_waived(&mock_server).await;
    Mock::given(method("POST"))
        .and(path("/casLogin"))
        .respond_with(support::login_success("TGT-2-file", -1, ""))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut first = manager_for(&mock_server, &store_path);
    first
        .login(false, SERVICE)
        .await
        .expect("login should not error")
        .expect("first login should succeed");

    // Same file, new manager: the persisted token short-circuits the protocol.
    Mock::given(method("POST"))
        .and(path("/verifyTgt"))
        .and(header_regex("cookie", "TGT=TGT-2-file"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "info": "verify tgt success",
            "success": true,
            "redirectUrl": "https://ehall.seu.edu.cn/new/index.html",
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut second = manager_for(&mock_server, &store_path);
    let session = second
        .login(false, SERVICE)
        .await
        .expect("login should not error")
        .expect("second manager should resume the stored session");
    assert_eq!(
        session.redirect_url.as_deref(),
        Some("https://ehall.seu.edu.cn/new/index.html")
    );
}

#[tokio::test]
async fn test_device_fingerprint_is_stable_across_managers() {
    let mock_server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("auth_session.json");

    let key = TestKey::generate();
    mount_cipher_key(&mock_server, &key).await;
    mount_captcha_waived(&mock_server).await;
    Mock::given(method("POST"))
        .and(path("/casLogin"))
        .respond_with(support::login_success("TGT-3-file", -1, ""))
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut first = manager_for(&mock_server, &store_path);
    first
        .login(false, SERVICE)
        .await
        .expect("login should not error")
        .expect("first login should succeed");

    let mut second = manager_for(&mock_server, &store_path);
    second
        .login(true, SERVICE)
        .await
        .expect("login should not error")
        .expect("second login should succeed");

    let bodies = cas_login_bodies(&mock_server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["fingerPrint"].as_str().unwrap().len(), 32);
    assert_eq!(
        bodies[0]["fingerPrint"], bodies[1]["fingerPrint"],
        "a stable fingerprint keeps the device known across restarts"
    );

    let document = read_document(&store_path);
    assert_eq!(document["fingerprint"], bodies[0]["fingerPrint"]);
}

#[tokio::test]
async fn test_correlation_cache_recovers_reused_key_after_restart() {
    let mock_server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("auth_session.json");

    let key = TestKey::generate();
    // The first fetch issues the key with its cookie; every later fetch
    // reuses the key and sets nothing.
    Mock::given(method("POST"))
        .and(path("/getChiperKey"))
        .respond_with(support::cipher_key_response(key.public_b64(), Some("uid-original"), false))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/getChiperKey"))
        .respond_with(support::cipher_key_response(key.public_b64(), None, true))
        .expect(1)
        .mount(&mock_server)
        .await;
    mount_captcha_waived(&mock_server).await;
    Mock::given(method("POST"))
        .and(path("/casLogin"))
        .respond_with(support::login_success("TGT-4-file", -1, ""))
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut first = manager_for(&mock_server, &store_path);
    first
        .login(false, SERVICE)
        .await
        .expect("login should not error")
        .expect("first login should succeed");

    let mut second = manager_for(&mock_server, &store_path);
    second
        .login(true, SERVICE)
        .await
        .expect("login should not error")
        .expect("second login should succeed under the reused key");

    let requests = mock_server.received_requests().await.unwrap();
    let logins: Vec<_> = requests
        .iter()
        .filter(|request| request.url.path() == "/casLogin")
        .collect();
    assert_eq!(logins.len(), 2);
    let cookie_line = logins[1]
        .headers
        .get("Cookie")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    assert!(
        cookie_line.contains("CHIPER_UID=uid-original"),
        "the cached correlation cookie must ride the reused key, got: {cookie_line}"
    );
}

#[tokio::test]
async fn test_expired_persisted_token_is_replaced_by_fresh_login() {
    let mock_server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("auth_session.json");

    // Craft a store whose token expired long ago.
    let crafted = json!({
        "fingerprint": "0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c",
        "tokens": {
            "220230001": { "value": "TGT-long-gone", "expires_at": 1_000_000 }
        },
        "correlations": {}
    });
    std::fs::write(&store_path, serde_json::to_vec_pretty(&crafted).unwrap()).unwrap();

    Mock::given(method("POST"))
        .and(path("/verifyTgt"))
        .respond_with(support::envelope(200, "verify tgt success", true))
        .expect(0)
        .mount(&mock_server)
        .await;
    let key = TestKey::generate();
    mount_cipher_key(&mock_server, &key).await;
    mount_captcha_waived(&mock_server).await;
    Mock::given(method("POST"))
        .and(path("/casLogin"))
        .respond_with(support::login_success("TGT-5-renewed", 3600, ""))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut manager = manager_for(&mock_server, &store_path);
    manager
        .login(false, SERVICE)
        .await
        .expect("login should not error")
        .expect("login should succeed");

    // The crafted fingerprint was reused rather than regenerated.
    let bodies = cas_login_bodies(&mock_server).await;
    assert_eq!(bodies[0]["fingerPrint"], "0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c");

    let document = read_document(&store_path);
    assert_eq!(document["tokens"]["220230001"]["value"], "TGT-5-renewed");
    let expires_at = document["tokens"]["220230001"]["expires_at"].as_u64().unwrap();
    assert!(
        expires_at > 1_700_000_000,
        "a positive maxAge must be recorded as an absolute expiry, got {expires_at}"
    );
}
