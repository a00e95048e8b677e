//! Integration tests for the client-mode login flow.

mod common;

use common::{local_config, loopback, no_redirect_http, token_path, RecordingBrowser};
use pavlok::{Config, LocalOptions, LoginError, LoginState, PavlokClient, ServerOptions, TokenFile};
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_token_endpoint(server: &MockServer, code: &str, token: &str) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(query_param("code", code))
        .and(query_param("client_id", "client-id"))
        .and(query_param("client_secret", "client-secret"))
        .and(query_param("grant_type", "authorization_code"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": token })),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn next_opened(opened: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), opened.recv())
        .await
        .expect("browser was never opened")
        .expect("browser channel closed")
}

/// Base URL of the callback server from the URL handed to the browser.
fn callback_base(start_url: &str) -> String {
    loopback(start_url.trim_end_matches("/auth/pavlok"))
}

#[tokio::test]
async fn test_login_exchanges_code_and_saves_token() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_token_endpoint(&server, "abc123", "tok-1").await;

    let (browser, mut opened) = RecordingBrowser::new();
    let client = PavlokClient::new(local_config(&server, &dir))
        .unwrap()
        .with_browser(browser);
    assert_eq!(client.login_state(), LoginState::Idle);

    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login().await }
    });

    let start_url = next_opened(&mut opened).await;
    assert!(start_url.starts_with("http://localhost:"));
    assert_eq!(client.login_state(), LoginState::Listening);

    let base = callback_base(&start_url);
    let http = no_redirect_http();

    // The start page forwards to the Pavlok authorize endpoint
    let response = http.get(format!("{base}/auth/pavlok")).send().await.unwrap();
    assert!(response.status().is_redirection());
    let location = response.headers()["location"].to_str().unwrap().to_string();
    assert!(location.starts_with(&format!("{}/oauth/authorize", server.uri())));
    assert!(location.contains("response_type=code"));
    assert!(location.contains("client_id=client-id"));

    let response = http
        .get(format!("{base}/auth/pavlok/result?code=abc123"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    assert_eq!(response.headers()["location"], "/done");

    let token = login.await.unwrap().unwrap();
    assert_eq!(token, "tok-1");
    assert_eq!(client.login_state(), LoginState::Closed);

    let content = std::fs::read_to_string(token_path(&dir)).unwrap();
    let file: TokenFile = serde_json::from_str(&content).unwrap();
    assert_eq!(file.token.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn test_second_login_rejected_while_pending() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_token_endpoint(&server, "code-1", "tok-first").await;

    let (browser, mut opened) = RecordingBrowser::new();
    let client = PavlokClient::new(local_config(&server, &dir))
        .unwrap()
        .with_browser(browser);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.login().await }
    });
    let start_url = next_opened(&mut opened).await;

    let second = client.login().await;
    assert!(matches!(second, Err(LoginError::AlreadySigningIn)));
    assert_eq!(
        second.unwrap_err().to_string(),
        "already signing in"
    );

    no_redirect_http()
        .get(format!("{}/auth/pavlok/result?code=code-1", callback_base(&start_url)))
        .send()
        .await
        .unwrap();

    assert_eq!(first.await.unwrap().unwrap(), "tok-first");
}

#[tokio::test]
async fn test_missing_code_fails_login() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let (browser, mut opened) = RecordingBrowser::new();
    let client = PavlokClient::new(local_config(&server, &dir))
        .unwrap()
        .with_browser(browser);

    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login().await }
    });
    let start_url = next_opened(&mut opened).await;

    let body = no_redirect_http()
        .get(format!("{}/auth/pavlok/result", callback_base(&start_url)))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("rejected the request"));

    assert!(matches!(
        login.await.unwrap(),
        Err(LoginError::Rejected)
    ));
    assert!(!client.is_logged_in());
    assert_eq!(client.login_state(), LoginState::Closed);
}

#[tokio::test]
async fn test_failed_exchange_reports_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let (browser, mut opened) = RecordingBrowser::new();
    let client = PavlokClient::new(local_config(&server, &dir))
        .unwrap()
        .with_browser(browser);

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.spawn_login(move |success, token| {
        let _ = tx.send((success, token));
    });
    let start_url = next_opened(&mut opened).await;

    let response = no_redirect_http()
        .get(format!("{}/auth/pavlok/result?code=bad", callback_base(&start_url)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["location"], "/error");

    let (success, token) = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(!success);
    assert!(token.is_none());
}

#[tokio::test]
async fn test_login_timeout() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let config = local_config(&server, &dir).with_local_options(LocalOptions {
        port: 0,
        token_path: token_path(&dir),
        save: true,
        login_timeout: Some(Duration::from_millis(200)),
    });

    let (browser, _opened) = RecordingBrowser::new();
    let client = PavlokClient::new(config).unwrap().with_browser(browser);

    assert!(matches!(client.login().await, Err(LoginError::TimedOut)));
    assert_eq!(client.login_state(), LoginState::Closed);
}

#[tokio::test]
async fn test_login_invalid_in_server_mode() {
    let mut options = ServerOptions::new("http://app.test/pavlok/result", "/pavlok/result");
    options.session_secret = "secret".to_string();
    let client = PavlokClient::new(Config::server("client-id", "client-secret", options)).unwrap();

    assert!(matches!(client.login().await, Err(LoginError::WrongMode)));
}

fn timed_config(
    server: &MockServer,
    dir: &tempfile::TempDir,
    port: u16,
    limit: Duration,
) -> Config {
    local_config(server, dir).with_local_options(LocalOptions {
        port,
        token_path: token_path(dir),
        save: true,
        login_timeout: Some(limit),
    })
}

#[tokio::test]
async fn test_late_callback_after_timeout_is_ignored() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": "late-tok" })),
        )
        .expect(0)
        .mount(&server)
        .await;

    let (browser, mut opened) = RecordingBrowser::new();
    let client = PavlokClient::new(timed_config(&server, &dir, 0, Duration::from_millis(200)))
        .unwrap()
        .with_browser(browser);

    assert!(matches!(client.login().await, Err(LoginError::TimedOut)));
    let start_url = next_opened(&mut opened).await;

    // The callback server is gone once login() has returned
    let late = no_redirect_http()
        .get(format!("{}/auth/pavlok/result?code=c", callback_base(&start_url)))
        .send()
        .await;
    assert!(late.is_err());

    assert!(!client.is_logged_in());
    assert_eq!(client.login_state(), LoginState::Closed);
    let content = std::fs::read_to_string(token_path(&dir)).unwrap();
    let file: TokenFile = serde_json::from_str(&content).unwrap();
    assert!(file.token.is_none());
}

#[tokio::test]
async fn test_exchange_outliving_timeout_discards_token() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": "slow-tok" }))
                .set_delay(Duration::from_millis(600)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (browser, mut opened) = RecordingBrowser::new();
    let client = PavlokClient::new(timed_config(&server, &dir, 0, Duration::from_millis(300)))
        .unwrap()
        .with_browser(browser);

    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login().await }
    });
    let start_url = next_opened(&mut opened).await;

    let callback = tokio::spawn(
        no_redirect_http()
            .get(format!("{}/auth/pavlok/result?code=slow", callback_base(&start_url)))
            .send(),
    );

    assert!(matches!(login.await.unwrap(), Err(LoginError::TimedOut)));
    let response = callback.await.unwrap().unwrap();
    assert_eq!(response.headers()["location"], "/error");

    assert!(!client.is_logged_in());
    assert_eq!(client.login_state(), LoginState::Closed);
    let content = std::fs::read_to_string(token_path(&dir)).unwrap();
    let file: TokenFile = serde_json::from_str(&content).unwrap();
    assert!(file.token.is_none());
}

#[tokio::test]
async fn test_retry_on_fixed_port_after_timeout() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let (browser, _opened) = RecordingBrowser::new();
    let client = PavlokClient::new(timed_config(&server, &dir, port, Duration::from_millis(200)))
        .unwrap()
        .with_browser(browser);

    assert!(matches!(client.login().await, Err(LoginError::TimedOut)));
    assert!(matches!(client.login().await, Err(LoginError::TimedOut)));
}

#[tokio::test]
async fn test_concurrent_callbacks_exchange_once() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": "tok-once" }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (browser, mut opened) = RecordingBrowser::new();
    let client = PavlokClient::new(local_config(&server, &dir))
        .unwrap()
        .with_browser(browser);

    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login().await }
    });
    let start_url = next_opened(&mut opened).await;

    let url = format!("{}/auth/pavlok/result?code=dup", callback_base(&start_url));
    let http = no_redirect_http();
    let (first, second) = tokio::join!(http.get(&url).send(), http.get(&url).send());
    assert_eq!(first.unwrap().headers()["location"], "/done");
    assert_eq!(second.unwrap().headers()["location"], "/done");

    assert_eq!(login.await.unwrap().unwrap(), "tok-once");
}
