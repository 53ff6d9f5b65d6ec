use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use vaultlink_core::auth::{
    AuthManager, AuthState, Credentials, OAuthCredentials, PasswordCredentials, Session, SessionStore, StaticToken,
};
use vaultlink_core::{Config, VaultError};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUTH_PATH: &str = "/api/v25.1/auth";

fn auth_success(session_id: &str) -> Value {
    json!({
        "responseStatus": "SUCCESS",
        "sessionId": session_id,
        "userId": 1,
        "vaultIds": [{"id": 10, "name": "V1", "url": "https://v1.veevavault.com/api"}]
    })
}

fn password_config(server: &MockServer) -> Config {
    Config::new(&server.uri(), Credentials::password("svc@example.com", "pw")).unwrap()
}

fn oauth_config(server: &MockServer, expires_in: Option<u64>, fallback: bool) -> Config {
    let credentials = Credentials::OAuth(OAuthCredentials {
        profile_id: "0oa1".to_string(),
        token_source: Arc::new(StaticToken::new("idp-token", expires_in)),
        client_id: None,
        fallback: fallback.then(|| PasswordCredentials::new("svc@example.com", "pw")),
    });
    Config::new(&server.uri(), credentials)
        .unwrap()
        .with_oauth_login_url(&server.uri())
        .unwrap()
}

async fn mount_auth(server: &MockServer, session_id: &str, expected: u64) {
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_success(session_id)))
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_password_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .and(body_string_contains("username=svc%40example.com"))
        .and(header("x-vaultapi-clientid", "vaultlink"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseStatus": "SUCCESS",
            "sessionId": "abc123",
            "userId": 1,
            "vaultIds": [{"id": 10, "name": "V1"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    let session = manager.authenticate().await.unwrap();

    assert_eq!(session.session_id(), "abc123");
    assert_eq!(session.vault_id(), 10);
    assert_eq!(session.expires_at(), None);
    assert_eq!(manager.state(), AuthState::Authenticated);
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn test_no_vaults_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseStatus": "SUCCESS",
            "sessionId": "abc123",
            "userId": 1,
            "vaultIds": []
        })))
        .mount(&server)
        .await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    let err = manager.authenticate().await.unwrap_err();

    assert!(matches!(err, VaultError::Authentication(ref m) if m.contains("no vaults")));
    assert!(manager.current_session().is_none());
}

#[tokio::test]
async fn test_bad_password_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseStatus": "FAILURE",
            "errors": [{"type": "USERNAME_OR_PASSWORD_INCORRECT", "message": "Authentication failed for user: svc@example.com."}]
        })))
        .mount(&server)
        .await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    let err = manager.get_session().await.unwrap_err();
    assert!(matches!(err, VaultError::Authentication(_)));
    assert!(!manager.is_authenticated());
}

#[tokio::test]
async fn test_session_near_expiry_is_refreshed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/session/0oa1"))
        .and(header("authorization", "Bearer idp-token"))
        .and(body_string_contains("vaultDNS=127.0.0.1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_success("oauth-session")))
        .expect(2)
        .mount(&server)
        .await;

    // 200s of lifetime is inside the default 300s refresh window
    let manager = AuthManager::new(oauth_config(&server, Some(200), false)).unwrap();
    let first = manager.get_session().await.unwrap();
    assert_eq!(first.auth_mode(), Some("oauth"));
    assert!(first.expires_at().is_some());

    let second = manager.get_session().await.unwrap();
    assert!(second.created_at() >= first.created_at());
}

#[tokio::test]
async fn test_session_outside_threshold_is_reused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/session/0oa1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_success("oauth-session")))
        .expect(1)
        .mount(&server)
        .await;

    let manager = AuthManager::new(oauth_config(&server, Some(3600), false)).unwrap();
    let first = manager.get_session().await.unwrap();
    let second = manager.get_session().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_refresh_keeps_static_token_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/session/0oa1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_success("oauth-session")))
        .expect(2)
        .mount(&server)
        .await;

    let issued_at = chrono::Utc::now() - chrono::Duration::seconds(1000);
    let credentials = Credentials::OAuth(OAuthCredentials {
        profile_id: "0oa1".to_string(),
        token_source: Arc::new(StaticToken::new("idp-token", Some(3600)).with_issued_at(issued_at)),
        client_id: None,
        fallback: None,
    });
    let config = Config::new(&server.uri(), credentials)
        .unwrap()
        .with_oauth_login_url(&server.uri())
        .unwrap();
    let manager = AuthManager::new(config).unwrap();

    let token_expiry = issued_at + chrono::Duration::seconds(3600);
    let first = manager.get_session().await.unwrap();
    let second = manager.refresh_session().await.unwrap();
    for session in [first, second] {
        let expires_at = session.expires_at().unwrap();
        assert!(expires_at <= token_expiry + chrono::Duration::seconds(1), "{}", expires_at);
        assert!(expires_at >= token_expiry - chrono::Duration::seconds(5), "{}", expires_at);
    }
}

#[tokio::test]
async fn test_oauth_failure_falls_back_to_password() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/session/0oa1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "responseStatus": "FAILURE",
            "errors": [{"type": "INVALID_TOKEN", "message": "token rejected"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_auth(&server, "fallback-session", 1).await;

    let manager = AuthManager::new(oauth_config(&server, Some(3600), true)).unwrap();
    let session = manager.get_session().await.unwrap();

    assert_eq!(session.session_id(), "fallback-session");
    assert_eq!(session.auth_mode(), Some("password_fallback"));
    assert_eq!(session.expires_at(), None);
}

#[tokio::test]
async fn test_logout_clears_session_when_delete_times_out() {
    let server = MockServer::start().await;
    mount_auth(&server, "abc123", 1).await;
    Mock::given(method("DELETE"))
        .and(path("/api/v25.1/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"responseStatus": "SUCCESS"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let config = password_config(&server).with_timeout(Duration::from_millis(200));
    let manager = AuthManager::new(config).unwrap();
    manager.authenticate().await.unwrap();
    assert!(manager.is_authenticated());

    manager.logout().await;

    assert!(!manager.is_authenticated());
    assert!(manager.current_session().is_none());
}

#[tokio::test]
async fn test_logout_sends_session_header() {
    let server = MockServer::start().await;
    mount_auth(&server, "abc123", 1).await;
    Mock::given(method("DELETE"))
        .and(path("/api/v25.1/session"))
        .and(header("authorization", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responseStatus": "SUCCESS"})))
        .expect(1)
        .mount(&server)
        .await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    manager.authenticate().await.unwrap();
    manager.logout().await;
    assert_eq!(manager.state(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn test_request_timeout_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(auth_success("late"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let config = password_config(&server).with_timeout(Duration::from_millis(200));
    let manager = AuthManager::new(config).unwrap();
    let err = manager.authenticate().await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_session_authenticates_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(auth_success("shared"))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = Arc::new(AuthManager::new(password_config(&server)).unwrap());
    let calls = (0..16).map(|_| {
        let manager = Arc::clone(&manager);
        async move { manager.get_session().await }
    });
    let results = join_all(calls).await;

    for result in results {
        assert_eq!(result.unwrap().session_id(), "shared");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_collapses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(auth_success("first"))
                .set_delay(Duration::from_millis(100)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(auth_success("second"))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = Arc::new(AuthManager::new(password_config(&server)).unwrap());
    manager.authenticate().await.unwrap();

    let calls = (0..8).map(|_| {
        let manager = Arc::clone(&manager);
        async move { manager.refresh_session().await }
    });
    for result in join_all(calls).await {
        assert_eq!(result.unwrap().session_id(), "second");
    }
}

#[tokio::test]
async fn test_failed_refresh_keeps_current_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_success("good")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    manager.authenticate().await.unwrap();

    assert!(manager.refresh_session().await.is_err());

    let session = manager.get_session().await.unwrap();
    assert_eq!(session.session_id(), "good");
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn test_failed_renewal_returns_unexpired_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/session/0oa1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_success("short-lived")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/session/0oa1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    // Inside the refresh window but not yet expired
    let manager = AuthManager::new(oauth_config(&server, Some(120), false)).unwrap();
    manager.get_session().await.unwrap();

    let session = manager.get_session().await.unwrap();
    assert_eq!(session.session_id(), "short-lived");
}

#[tokio::test]
async fn test_keep_alive_drops_invalid_session() {
    let server = MockServer::start().await;
    mount_auth(&server, "stale", 1).await;
    Mock::given(method("POST"))
        .and(path("/api/v25.1/keep-alive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseStatus": "FAILURE",
            "errors": [{"type": "INVALID_SESSION_ID", "message": "Invalid or expired session ID."}]
        })))
        .mount(&server)
        .await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    manager.authenticate().await.unwrap();

    let err = manager.keep_alive().await.unwrap_err();
    assert!(err.is_session_expired());
    assert!(manager.current_session().is_none());
}

#[tokio::test]
async fn test_keep_alive_success() {
    let server = MockServer::start().await;
    mount_auth(&server, "alive", 1).await;
    Mock::given(method("POST"))
        .and(path("/api/v25.1/keep-alive"))
        .and(header("authorization", "alive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responseStatus": "SUCCESS"})))
        .expect(1)
        .mount(&server)
        .await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    manager.authenticate().await.unwrap();
    manager.keep_alive().await.unwrap();
    assert!(manager.is_authenticated());
}

#[tokio::test]
async fn test_background_keep_alive_pings() {
    let server = MockServer::start().await;
    mount_auth(&server, "alive", 1).await;
    Mock::given(method("POST"))
        .and(path("/api/v25.1/keep-alive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responseStatus": "SUCCESS"})))
        .mount(&server)
        .await;

    let manager = Arc::new(AuthManager::new(password_config(&server)).unwrap());
    manager.authenticate().await.unwrap();

    let handle = manager.spawn_keep_alive(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(handle);

    let pings = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/api/v25.1/keep-alive")
        .count();
    assert!(pings >= 2, "expected repeated keep-alive pings, got {}", pings);
}

#[tokio::test]
async fn test_persisted_session_is_restored() {
    let server = MockServer::start().await;
    mount_auth(&server, "persisted", 1).await;
    let cache = tempfile::tempdir().unwrap();

    let config = password_config(&server).with_session_cache(cache.path().to_path_buf());
    let first = AuthManager::new(config.clone()).unwrap();
    first.authenticate().await.unwrap();

    let second = AuthManager::new(config.clone()).unwrap();
    assert!(second.is_authenticated());
    assert_eq!(second.get_session().await.unwrap().session_id(), "persisted");

    second.invalidate("persisted");
    let third = AuthManager::new(config).unwrap();
    assert!(third.current_session().is_none());
}

#[tokio::test]
async fn test_invalidate_ignores_replaced_session() {
    let server = MockServer::start().await;
    mount_auth(&server, "current", 1).await;

    let manager = AuthManager::new(password_config(&server)).unwrap();
    manager.authenticate().await.unwrap();

    assert!(!manager.invalidate("some-older-session"));
    assert!(manager.is_authenticated());
    assert!(manager.invalidate("current"));
    assert!(!manager.is_authenticated());
}

#[tokio::test]
async fn test_session_only_never_sends_credentials() {
    let server = MockServer::start().await;
    mount_auth(&server, "unused", 0).await;
    let cache = tempfile::tempdir().unwrap();

    let config = Config::new(&server.uri(), Credentials::SessionOnly)
        .unwrap()
        .with_session_cache(cache.path().to_path_buf());
    let stale = Session::new("stale", 1, 10, "V1", chrono::Utc::now()).unwrap();
    SessionStore::new(cache.path().to_path_buf(), config.host())
        .save(&stale)
        .unwrap();

    let manager = AuthManager::new(config).unwrap();
    assert_eq!(manager.get_session().await.unwrap().session_id(), "stale");

    let err = manager.refresh_session().await.unwrap_err();
    assert!(matches!(err, VaultError::Authentication(_)), "{:?}", err);
    assert_eq!(manager.current_session().unwrap().session_id(), "stale");

    assert!(manager.invalidate("stale"));
    let err = manager.get_session().await.unwrap_err();
    assert!(matches!(err, VaultError::Authentication(_)), "{:?}", err);
}
