//! Server mode: the OAuth callback as a route inside the caller's axum app.
//!
//! Tokens are kept per user session instead of in a file. Sessions are
//! identified either by a [`SessionId`] extension that the application
//! inserts itself, or by a signed `pavlok_session` cookie issued here when
//! `handle_sessions` is enabled.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use pavlok::{Config, EmbeddedAuth, PavlokClient, ServerOptions};
//!
//! let mut options = ServerOptions::new("https://example.com/pavlok/result", "/pavlok/result");
//! options.auth_path = Some("/pavlok/auth".to_string());
//! options.session_secret = "change me".to_string();
//!
//! let client = PavlokClient::new(Config::server("client-id", "client-secret", options))?;
//! let auth = EmbeddedAuth::new(client)?;
//! let app = axum::Router::new().merge(auth.router());
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

use crate::client::{ApiError, PavlokClient, StepsQuery};
use crate::config::{ConfigError, ServerOptions};
use crate::oauth::{self, OAuthError};
use crate::stimulus::{Stimulus, StimulusRequest};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Extension, Router,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

/// Name of the session cookie issued when sessions are handled here.
pub const SESSION_COOKIE: &str = "pavlok_session";

/// Identifies a user session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Pavlok data kept in a user session.
#[derive(Debug, Clone, Default)]
pub struct PavlokSession {
    pub token: Option<String>,
    /// Full token endpoint response
    pub user: Option<serde_json::Value>,
}

/// Storage for per-session Pavlok data.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &SessionId) -> Option<PavlokSession>;
    fn store(&self, id: &SessionId, session: PavlokSession);
}

/// Process-local session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, PavlokSession>>,
}

impl SessionStore for MemorySessionStore {
    fn load(&self, id: &SessionId) -> Option<PavlokSession> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn store(&self, id: &SessionId, session: PavlokSession) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), session);
    }
}

/// OAuth callback handling for server mode.
#[derive(Clone)]
pub struct EmbeddedAuth {
    client: PavlokClient,
    options: Arc<ServerOptions>,
    sessions: Arc<dyn SessionStore>,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
}

impl EmbeddedAuth {
    /// Wrap a server-mode client. Uses a [`MemorySessionStore`] until
    /// [`with_store`](Self::with_store) replaces it.
    pub fn new(client: PavlokClient) -> Result<Self, ConfigError> {
        let Some(options) = client.config().server_options().cloned() else {
            tracing::error!("EmbeddedAuth needs a server-mode configuration");
            return Err(ConfigError::Invalid(
                "embedded auth requires server mode".to_string(),
            ));
        };
        if options.handle_sessions {
            tracing::debug!("Internally handling sessions...");
        } else {
            tracing::debug!("Sessions are handled by the application");
        }

        Ok(Self {
            client,
            options: Arc::new(options),
            sessions: Arc::new(MemorySessionStore::default()),
        })
    }

    pub fn with_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.sessions = Arc::new(store);
        self
    }

    pub fn client(&self) -> &PavlokClient {
        &self.client
    }

    /// Routes to merge into the application: the callback path and, if
    /// configured, the auth path.
    pub fn router(&self) -> Router {
        let mut router = Router::new().route(&self.options.callback_path, get(handle_callback));
        if let Some(auth_path) = &self.options.auth_path {
            router = router.route(auth_path, get(start_auth));
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Pavlok authorize URL for this application's callback.
    pub fn authorize_url(&self) -> Result<url::Url, OAuthError> {
        oauth::authorize_url(
            self.client.config().api_root(),
            &self.client.config().credentials.client_id,
            &self.options.callback_url,
        )
    }

    /// Redirect to the Pavlok authorize page, for applications that serve
    /// their own sign-in route.
    pub fn authorize_redirect(&self) -> Response {
        match self.authorize_url() {
            Ok(url) => Redirect::to(url.as_str()).into_response(),
            Err(e) => {
                tracing::error!("{e}");
                Redirect::to(&self.options.failure_path).into_response()
            }
        }
    }

    /// Session id from a verified session cookie.
    pub fn session_from_headers(&self, headers: &HeaderMap) -> Option<SessionId> {
        let value = cookie_value(headers, SESSION_COOKIE)?;
        verify_session_cookie(&self.options.session_secret, value)
    }

    /// `Set-Cookie` value carrying a signed session id.
    pub fn session_cookie(&self, id: &SessionId) -> String {
        format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax",
            sign_session(&self.options.session_secret, id)
        )
    }

    pub fn is_logged_in(&self, id: &SessionId) -> bool {
        self.token(id).is_some()
    }

    pub fn token(&self, id: &SessionId) -> Option<String> {
        self.sessions.load(id).and_then(|session| session.token)
    }

    /// Token endpoint response saved at login.
    pub fn user(&self, id: &SessionId) -> Option<serde_json::Value> {
        self.sessions.load(id).and_then(|session| session.user)
    }

    /// Remove the token from a session.
    pub fn logout(&self, id: &SessionId) {
        if let Some(mut session) = self.sessions.load(id) {
            session.token = None;
            self.sessions.store(id, session);
        }
    }

    /// Send a stimulus with the session's token, clearing it on 401.
    ///
    /// A token set on the request is used as is and a 401 for it leaves the
    /// session alone.
    pub async fn send(
        &self,
        id: &SessionId,
        stimulus: Stimulus,
        mut request: StimulusRequest,
    ) -> Result<String, ApiError> {
        if request.token.is_some() {
            return self.client.send(stimulus, request).await;
        }
        request.token = Some(self.token(id).ok_or(ApiError::LoginRequired)?);
        let result = self.client.send(stimulus, request).await;
        self.forget_expired(id, result)
    }

    pub async fn me(&self, id: &SessionId) -> Result<String, ApiError> {
        let token = self.token(id).ok_or(ApiError::LoginRequired)?;
        let result = self.client.me(Some(&token)).await;
        self.forget_expired(id, result)
    }

    pub async fn steps(&self, id: &SessionId, range: StepsQuery) -> Result<String, ApiError> {
        let token = self.token(id).ok_or(ApiError::LoginRequired)?;
        let result = self.client.steps(range, Some(&token)).await;
        self.forget_expired(id, result)
    }

    fn forget_expired(
        &self,
        id: &SessionId,
        result: Result<String, ApiError>,
    ) -> Result<String, ApiError> {
        if matches!(result, Err(ApiError::TokenExpired)) {
            self.logout(id);
        }
        result
    }

    /// Session for a callback request, plus a cookie to set if a new one
    /// was issued.
    fn resolve_session(
        &self,
        extension: Option<SessionId>,
        headers: &HeaderMap,
    ) -> Option<(SessionId, Option<String>)> {
        if let Some(id) = extension {
            return Some((id, None));
        }
        if !self.options.handle_sessions {
            return None;
        }
        match self.session_from_headers(headers) {
            Some(id) => Some((id, None)),
            None => {
                let id = SessionId::generate();
                let cookie = self.session_cookie(&id);
                Some((id, Some(cookie)))
            }
        }
    }

    fn success_target(&self, token: &str) -> String {
        if self.options.success_with_code {
            let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
            format!("{}?code={encoded}", self.options.success_path)
        } else {
            self.options.success_path.clone()
        }
    }
}

/// GET {auth_path}
async fn start_auth(State(auth): State<EmbeddedAuth>) -> Response {
    auth.authorize_redirect()
}

/// GET {callback_path}
async fn handle_callback(
    State(auth): State<EmbeddedAuth>,
    Query(params): Query<CallbackParams>,
    extension: Option<Extension<SessionId>>,
    headers: HeaderMap,
) -> Response {
    let failure = Redirect::to(&auth.options.failure_path).into_response();

    let Some((id, new_cookie)) =
        auth.resolve_session(extension.map(|Extension(id)| id), &headers)
    else {
        tracing::error!("No session available for the Pavlok callback; insert a SessionId extension");
        return failure;
    };

    let Some(code) = params.code.filter(|code| !code.is_empty()) else {
        return failure;
    };

    let response = match auth
        .client
        .exchange_code(&code, &auth.options.callback_url)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Token exchange failed: {e}");
            return failure;
        }
    };

    let target = auth.success_target(&response.access_token);
    auth.sessions.store(
        &id,
        PavlokSession {
            token: Some(response.access_token),
            user: Some(response.raw),
        },
    );
    auth.client.progress(format_args!("Stored Pavlok token in session"));

    let mut redirect = Redirect::to(&target).into_response();
    if let Some(cookie) = new_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            redirect.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    redirect
}

/// Value of cookie `name` from the request's `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn session_signature(secret: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((secret.len() as u64).to_le_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

fn sign_session(secret: &str, id: &SessionId) -> String {
    format!("{}.{}", id.as_str(), session_signature(secret, id.as_str()))
}

fn verify_session_cookie(secret: &str, value: &str) -> Option<SessionId> {
    let (id, signature) = value.split_once('.')?;
    uuid::Uuid::parse_str(id).ok()?;
    let expected = session_signature(secret, id);
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Some(SessionId::from(id))
    } else {
        None
    }
}
