use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use helpdesk_recovery::config::{BackendConfig, RecoveryConfig};
use helpdesk_recovery::{
    ConnectivityProbe, ErrorRecoveryService, HttpConnectivityProbe, HttpSessionRefresher,
    OperationContext, OperationError, RecoveryError, Session, SessionRefresher, SessionStore,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer) -> BackendConfig {
    BackendConfig {
        url: server.uri(),
        anon_key: Some("anon-key".to_string()),
        request_timeout_ms: 2000,
        ..BackendConfig::default()
    }
}

fn stored_session() -> SessionStore {
    SessionStore::with_session(Session::new("stale-access", Some("refresh-1".to_string())))
}

#[tokio::test]
async fn probe_reports_healthy_backend() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/"))
        .and(header("apikey", "anon-key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let probe = HttpConnectivityProbe::new(reqwest::Client::new(), &backend(&server));
    assert!(probe.probe().await.is_ok());
}

#[tokio::test]
async fn probe_treats_server_errors_as_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let probe = HttpConnectivityProbe::new(reqwest::Client::new(), &backend(&server));
    assert!(matches!(
        probe.probe().await,
        Err(RecoveryError::Unhealthy(503))
    ));

    let config = RecoveryConfig {
        backend: backend(&server),
        ..RecoveryConfig::default()
    };
    let svc = ErrorRecoveryService::from_config(&config, SessionStore::new()).expect("service");
    assert!(!svc.test_connectivity().await);
}

#[tokio::test]
async fn connectivity_is_false_when_nothing_listens() {
    let config = RecoveryConfig {
        backend: BackendConfig {
            url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 500,
            ..BackendConfig::default()
        },
        ..RecoveryConfig::default()
    };
    let svc = ErrorRecoveryService::from_config(&config, SessionStore::new()).expect("service");
    assert!(!svc.test_connectivity().await);
}

#[tokio::test]
async fn refresh_stores_new_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .and(header("apikey", "anon-key"))
        .and(body_json(json!({ "refresh_token": "refresh-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-access",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = stored_session();
    let refresher = HttpSessionRefresher::new(reqwest::Client::new(), &backend(&server), store);
    let session = refresher.refresh().await.expect("refresh");

    assert_eq!(session.access_token, "fresh-access");
    assert_eq!(session.refresh_token.as_deref(), Some("refresh-2"));
    assert!(!session.is_expired());

    let current = refresher.store().current().await.expect("stored session");
    assert_eq!(current.access_token, "fresh-access");
}

#[tokio::test]
async fn refresh_keeps_refresh_token_when_not_rotated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "fresh-access" })),
        )
        .mount(&server)
        .await;

    let refresher =
        HttpSessionRefresher::new(reqwest::Client::new(), &backend(&server), stored_session());
    let session = refresher.refresh().await.expect("refresh");

    assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(session.expires_at, None);
}

#[tokio::test]
async fn rejected_refresh_surfaces_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let refresher =
        HttpSessionRefresher::new(reqwest::Client::new(), &backend(&server), stored_session());
    match refresher.refresh().await {
        Err(RecoveryError::RefreshRejected { status, body }) => {
            assert_eq!(status, 400);
            assert_eq!(body, "invalid_grant");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    // The stale session is left in place.
    let current = refresher.store().current().await.expect("session");
    assert_eq!(current.access_token, "stale-access");
}

#[tokio::test]
async fn malformed_refresh_response_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let refresher =
        HttpSessionRefresher::new(reqwest::Client::new(), &backend(&server), stored_session());
    assert!(matches!(
        refresher.refresh().await,
        Err(RecoveryError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn configured_service_refreshes_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "fresh-access" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = RecoveryConfig {
        backend: backend(&server),
        ..RecoveryConfig::default()
    };
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;

    let store = stored_session();
    let svc = ErrorRecoveryService::from_config(&config, store.clone()).expect("service");

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = svc
        .execute_with_retry(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(OperationError::new("JWT expired").with_status(401))
                    } else {
                        Ok("profile")
                    }
                }
            },
            OperationContext::named("profile.get"),
            None,
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.attempts, 2);
    assert_eq!(result.action_names(), vec!["token_refreshed"]);
    assert_eq!(
        store.current().await.map(|s| s.access_token),
        Some("fresh-access".to_string())
    );
}
