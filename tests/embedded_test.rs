//! Integration tests for the server-mode callback route

#[cfg(feature = "server")]
mod embedded_tests {
    use axum::http::{header, HeaderMap, HeaderValue};
    use pavlok::{
        ApiError, Config, EmbeddedAuth, LocalOptions, PavlokClient, ServerOptions, SessionId,
        Stimulus, StimulusRequest,
    };
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CALLBACK_URL: &str = "http://app.test/pavlok/result";

    fn server_options() -> ServerOptions {
        let mut options = ServerOptions::new(CALLBACK_URL, "/pavlok/result");
        options.auth_path = Some("/pavlok/auth".to_string());
        options.success_path = "/home".to_string();
        options.failure_path = "/oops".to_string();
        options.session_secret = "s3cret".to_string();
        options
    }

    fn embedded_auth(api: &MockServer, options: ServerOptions) -> EmbeddedAuth {
        let config =
            Config::server("client-id", "client-secret", options).with_base_url(api.uri());
        EmbeddedAuth::new(PavlokClient::new(config).unwrap()).unwrap()
    }

    /// Serve the auth routes on a free port.
    async fn serve(auth: &EmbeddedAuth) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().merge(auth.router());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    async fn mount_token_endpoint(api: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(query_param("code", "xyz"))
            .and(query_param("redirect_uri", CALLBACK_URL))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-9",
                "user_id": 42
            })))
            .mount(api)
            .await;
    }

    /// Session id carried by the cookie in a callback response.
    fn session_from_response(auth: &EmbeddedAuth, response: &reqwest::Response) -> SessionId {
        let set_cookie = response.headers()["set-cookie"].to_str().unwrap();
        let pair = set_cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(pair).unwrap());
        auth.session_from_headers(&headers).expect("cookie should verify")
    }

    #[tokio::test]
    async fn test_auth_path_redirects_to_authorize() {
        let api = MockServer::start().await;
        let auth = embedded_auth(&api, server_options());
        let addr = serve(&auth).await;

        let response = http()
            .get(format!("http://{addr}/pavlok/auth"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with(&format!("{}/oauth/authorize", api.uri())));
        assert!(location.contains("redirect_uri=http%3A%2F%2Fapp.test%2Fpavlok%2Fresult"));
    }

    #[tokio::test]
    async fn test_callback_stores_token_in_session() {
        let api = MockServer::start().await;
        mount_token_endpoint(&api).await;
        let auth = embedded_auth(&api, server_options());
        let addr = serve(&auth).await;

        let response = http()
            .get(format!("http://{addr}/pavlok/result?code=xyz"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        assert_eq!(response.headers()["location"], "/home");

        let session = session_from_response(&auth, &response);
        assert!(auth.is_logged_in(&session));
        assert_eq!(auth.token(&session).as_deref(), Some("tok-9"));
        assert_eq!(auth.user(&session).unwrap()["user_id"], 42);

        auth.logout(&session);
        assert!(!auth.is_logged_in(&session));
    }

    #[tokio::test]
    async fn test_success_with_code() {
        let api = MockServer::start().await;
        mount_token_endpoint(&api).await;
        let mut options = server_options();
        options.success_with_code = true;
        let auth = embedded_auth(&api, options);
        let addr = serve(&auth).await;

        let response = http()
            .get(format!("http://{addr}/pavlok/result?code=xyz"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()["location"], "/home?code=tok-9");
    }

    #[tokio::test]
    async fn test_missing_code_redirects_to_failure() {
        let api = MockServer::start().await;
        let auth = embedded_auth(&api, server_options());
        let addr = serve(&auth).await;

        let response = http()
            .get(format!("http://{addr}/pavlok/result"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()["location"], "/oops");
    }

    #[tokio::test]
    async fn test_unmanaged_sessions_need_extension() {
        let api = MockServer::start().await;
        mount_token_endpoint(&api).await;
        let mut options = server_options();
        options.handle_sessions = false;
        let auth = embedded_auth(&api, options);
        let addr = serve(&auth).await;

        let response = http()
            .get(format!("http://{addr}/pavlok/result?code=xyz"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()["location"], "/oops");
        assert!(response.headers().get("set-cookie").is_none());
    }

    #[tokio::test]
    async fn test_session_send_clears_expired_token() {
        let api = MockServer::start().await;
        mount_token_endpoint(&api).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/stimuli/vibration/100"))
            .and(query_param("access_token", "tok-9"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&api)
            .await;

        let auth = embedded_auth(&api, server_options());
        let addr = serve(&auth).await;

        let response = http()
            .get(format!("http://{addr}/pavlok/result?code=xyz"))
            .send()
            .await
            .unwrap();
        let session = session_from_response(&auth, &response);

        let err = auth
            .send(&session, Stimulus::Vibration, StimulusRequest::new(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TokenExpired));
        assert!(!auth.is_logged_in(&session));

        let err = auth
            .send(&session, Stimulus::Vibration, StimulusRequest::new(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::LoginRequired));
    }

    #[tokio::test]
    async fn test_explicit_token_expiry_keeps_session() {
        let api = MockServer::start().await;
        mount_token_endpoint(&api).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/stimuli/beep/20"))
            .and(query_param("access_token", "someone-else"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&api)
            .await;

        let auth = embedded_auth(&api, server_options());
        let addr = serve(&auth).await;

        let response = http()
            .get(format!("http://{addr}/pavlok/result?code=xyz"))
            .send()
            .await
            .unwrap();
        let session = session_from_response(&auth, &response);

        let err = auth
            .send(
                &session,
                Stimulus::Beep,
                StimulusRequest::new(20).with_token("someone-else"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TokenExpired));
        assert_eq!(auth.token(&session).as_deref(), Some("tok-9"));
    }

    #[tokio::test]
    async fn test_requires_server_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new("client-id", "client-secret").with_local_options(LocalOptions {
            port: 0,
            token_path: dir.path().join("pavlok-token.json"),
            save: false,
            login_timeout: None,
        });
        let client = PavlokClient::new(config).unwrap();
        assert!(EmbeddedAuth::new(client).is_err());
    }
}
