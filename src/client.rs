//! Pavlok API client: stimulus dispatch and profile queries.

use crate::config::{Config, ConfigError};
use crate::login::{BrowserOpener, LoginState, SystemBrowser};
use crate::oauth::{self, OAuthError, TokenResponse};
use crate::stimulus::{Stimulus, StimulusRequest, ValidationError};
use crate::token::{TokenError, TokenStore};
use chrono::{NaiveDate, Utc};
use reqwest::{Method, StatusCode};
use std::sync::{Arc, Mutex};

/// Client context for one configuration.
///
/// Cloning is cheap and clones share the token cache and login state, so a
/// clone can be moved into a spawned task.
#[derive(Clone)]
pub struct PavlokClient {
    config: Arc<Config>,
    http: reqwest::Client,
    tokens: Arc<TokenStore>,
    pub(crate) login_state: Arc<Mutex<LoginState>>,
    pub(crate) browser: Arc<dyn BrowserOpener>,
}

/// Where a request's token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    Explicit,
    Store,
}

/// Optional date range for the steps query.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepsQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl PavlokClient {
    /// Create a client, loading any saved token in client mode.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("pavlok-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("Failed to create HTTP client: {e}")))?;

        let tokens = match config.local() {
            Some(local) => {
                tracing::debug!("Initing client...");
                TokenStore::open(&local.token_path, local.save)
            }
            None => {
                tracing::debug!("Initing server...");
                TokenStore::in_memory()
            }
        };

        Ok(Self {
            config: Arc::new(config),
            http,
            tokens: Arc::new(tokens),
            login_state: Arc::new(Mutex::new(LoginState::Idle)),
            browser: Arc::new(SystemBrowser),
        })
    }

    /// Replace the browser launcher used by [`login`](Self::login).
    pub fn with_browser(mut self, browser: impl BrowserOpener + 'static) -> Self {
        self.browser = Arc::new(browser);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Whether a token is cached (client mode).
    pub fn is_logged_in(&self) -> bool {
        self.tokens.has_token()
    }

    /// Forget the saved token. Client mode only; in server mode tokens live
    /// in sessions, see `EmbeddedAuth::logout`.
    pub fn logout(&self) -> Result<(), ApiError> {
        if self.config.is_server() {
            return Err(ApiError::WrongMode("logout without a session in server mode"));
        }
        self.tokens.clear().map_err(ApiError::Storage)?;
        self.progress(format_args!("Logged out"));
        Ok(())
    }

    /// Log a progress message; `info` when verbose, `debug` otherwise.
    pub(crate) fn progress(&self, message: std::fmt::Arguments<'_>) {
        if self.config.verbose {
            tracing::info!("{message}");
        } else {
            tracing::debug!("{message}");
        }
    }

    pub(crate) async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OAuthError> {
        oauth::exchange_code(
            &self.http,
            self.config.api_root(),
            &self.config.credentials,
            code,
            redirect_uri,
        )
        .await
    }

    /// Send a stimulus.
    ///
    /// Checks run in order: token present, intensity in range, pattern
    /// names recognized, count at least one. Any failure returns before a
    /// request is made. On success the returned message is `"{route} sent."`.
    pub async fn send(
        &self,
        stimulus: Stimulus,
        request: StimulusRequest,
    ) -> Result<String, ApiError> {
        let (token, source) = self.resolve_token(request.token.as_deref())?;
        let path = request.stimulus_path(stimulus)?;

        let reason = request
            .message
            .unwrap_or_else(|| self.config.default_message.clone());
        let route = stimulus.route();

        self.progress(format_args!(
            "Trying to {route} with {}...",
            request.intensity
        ));

        let query = [
            ("access_token", token),
            ("reason", reason),
            ("time", Utc::now().to_rfc3339()),
        ];
        self.call(Method::POST, route, &path, &query, source)
            .await?;

        Ok(format!("{route} sent."))
    }

    pub async fn beep(&self, request: StimulusRequest) -> Result<String, ApiError> {
        self.send(Stimulus::Beep, request).await
    }

    /// Legacy beep where `tone` is 1-4.
    pub async fn beep_tone(&self, tone: u32) -> Result<String, ApiError> {
        self.send(Stimulus::BeepTone, StimulusRequest::new(tone))
            .await
    }

    pub async fn vibrate(&self, request: StimulusRequest) -> Result<String, ApiError> {
        self.send(Stimulus::Vibration, request).await
    }

    pub async fn zap(&self, request: StimulusRequest) -> Result<String, ApiError> {
        self.send(Stimulus::Shock, request).await
    }

    pub async fn pattern(&self, request: StimulusRequest) -> Result<String, ApiError> {
        self.send(Stimulus::Pattern, request).await
    }

    /// Fetch the user's profile, returning the raw response body.
    pub async fn me(&self, token: Option<&str>) -> Result<String, ApiError> {
        let (token, source) = self.resolve_token(token)?;
        self.progress(format_args!("Getting user details..."));

        let query = [("access_token", token), ("time", Utc::now().to_rfc3339())];
        self.call(Method::GET, "me", "/api/v1/me", &query, source)
            .await
    }

    /// Fetch step counts, returning the raw response body.
    pub async fn steps(&self, range: StepsQuery, token: Option<&str>) -> Result<String, ApiError> {
        let (token, source) = self.resolve_token(token)?;
        self.progress(format_args!("Getting user steps..."));

        let mut query = vec![("access_token", token)];
        if let Some(from) = range.from {
            query.push(("from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = range.to {
            query.push(("to", to.format("%Y-%m-%d").to_string()));
        }
        self.call(Method::GET, "steps", "/api/v1/fitness/steps", &query, source)
            .await
    }

    /// Run [`send`](Self::send) on a background task and report the outcome
    /// through `callback` as `(success, message)`.
    pub fn spawn_send<F>(
        &self,
        stimulus: Stimulus,
        request: StimulusRequest,
        callback: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(bool, String) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            let (success, message) = into_outcome(client.send(stimulus, request).await);
            callback(success, message);
        })
    }

    fn resolve_token(&self, explicit: Option<&str>) -> Result<(String, TokenSource), ApiError> {
        if let Some(token) = explicit {
            return Ok((token.to_string(), TokenSource::Explicit));
        }
        self.tokens
            .current()
            .map(|token| (token, TokenSource::Store))
            .ok_or(ApiError::LoginRequired)
    }

    async fn call(
        &self,
        method: Method,
        route: &str,
        path: &str,
        query: &[(&str, String)],
        source: TokenSource,
    ) -> Result<String, ApiError> {
        let url = format!("{}{path}", self.config.api_root());
        let response = self
            .http
            .request(method, &url)
            .query(query)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                tracing::warn!("Pavlok auth token rejected by {route}; clearing it");
                if source == TokenSource::Store {
                    self.tokens.clear().map_err(ApiError::Storage)?;
                }
                Err(ApiError::TokenExpired)
            }
            StatusCode::OK => response
                .text()
                .await
                .map_err(|e| ApiError::Network(e.to_string())),
            status => Err(ApiError::UnexpectedStatus {
                route: route.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

/// Flatten a call result into the `(success, message)` pair used by
/// callback-style callers.
pub fn into_outcome(result: Result<String, ApiError>) -> (bool, String) {
    match result {
        Ok(message) => (true, message),
        Err(e) => (false, e.to_string()),
    }
}

/// API call errors.
#[derive(Debug)]
pub enum ApiError {
    /// No token available
    LoginRequired,
    /// The API answered 401; the stored token has been cleared
    TokenExpired,
    /// Rejected before sending
    Invalid(ValidationError),
    UnexpectedStatus { route: String, status: u16 },
    Network(String),
    Storage(TokenError),
    WrongMode(&'static str),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::LoginRequired => {
                write!(f, "login required: please login before using the API")
            }
            ApiError::TokenExpired => write!(f, "token expired: your auth token has expired"),
            ApiError::Invalid(e) => write!(f, "{e}"),
            ApiError::UnexpectedStatus { route, status } => {
                write!(f, "{route} returned unknown code: {status}.")
            }
            ApiError::Network(msg) => write!(f, "network error: {msg}"),
            ApiError::Storage(e) => write!(f, "{e}"),
            ApiError::WrongMode(what) => write!(f, "invalid in this mode: {what}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Invalid(e) => Some(e),
            ApiError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Invalid(e)
    }
}
