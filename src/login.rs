//! Client-mode login through a short-lived local callback server.
//!
//! ```text
//! login() ──→ bind 127.0.0.1:port ──→ open browser at /auth/pavlok
//!                                            │
//!                  Pavlok authorize page ◀───┘
//!                           │
//!   GET /auth/pavlok/result?code=… ──→ POST /oauth/token ──→ save token
//!                           │
//!                     server closed
//! ```

use crate::client::PavlokClient;
use crate::config::{LocalOptions, LOCAL_CALLBACK_PATH};
use crate::oauth::{self, OAuthError};
use crate::token::TokenError;
use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

/// How long the callback server keeps serving after the login settles, so
/// the browser can follow the redirect to the done/error page.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const INDEX_PAGE: &str = "<!doctype html><title>Pavlok</title>\
<p><a href=\"/auth/pavlok\">Sign in with Pavlok</a></p>";
const DONE_PAGE: &str = "<!doctype html><title>Pavlok</title>\
<p>Signed in. You can close this window.</p>";
const ERROR_PAGE: &str = "<!doctype html><title>Pavlok</title>\
<p>Sign in failed. Please try again.</p>";
const REJECTED_PAGE: &str = "You've rejected the request to authenticate. Please try again.";

/// Progress of the client-mode login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    Listening,
    Exchanging,
    Closed,
}

impl LoginState {
    fn in_flight(self) -> bool {
        matches!(self, LoginState::Listening | LoginState::Exchanging)
    }
}

/// Opens the authorization page for the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs with the platform's default browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        browser_command(url).spawn().map(|_| ())
    }
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("open");
    cmd.arg(url);
    cmd
}

#[cfg(target_os = "windows")]
fn browser_command(url: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("cmd");
    cmd.args(["/C", "start", "", url]);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn browser_command(url: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("xdg-open");
    cmd.arg(url);
    cmd
}

/// Marks a login as in flight; closes it on drop, including when the login
/// future is cancelled.
struct LoginGuard {
    state: Arc<Mutex<LoginState>>,
}

impl Drop for LoginGuard {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = LoginState::Closed;
    }
}

/// Shared state of one callback server.
struct CallbackState {
    client: PavlokClient,
    redirect_uri: String,
    authorize_url: String,
    outcome: Mutex<Option<oneshot::Sender<Result<String, LoginError>>>>,
}

impl CallbackState {
    /// Take the right to settle the login. Only the first caller gets it;
    /// everyone after sees the login as already handled.
    fn claim(&self) -> Option<oneshot::Sender<Result<String, LoginError>>> {
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
}

impl PavlokClient {
    /// Current state of the login flow.
    pub fn login_state(&self) -> LoginState {
        *self.login_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log in, returning the access token.
    ///
    /// A cached token is returned straight away. Otherwise a callback server
    /// is started on the configured port, the authorization page is opened
    /// in the browser, and the call resolves once the redirect has been
    /// handled and the server has closed, so the port is free again on
    /// return. Only one login may be in flight; a second call fails with
    /// [`LoginError::AlreadySigningIn`].
    pub async fn login(&self) -> Result<String, LoginError> {
        let Some(options) = self.config().local() else {
            tracing::error!("Login is invalid when running as a server");
            return Err(LoginError::WrongMode);
        };
        let (port, login_timeout) = (options.port, options.login_timeout);

        let _guard = {
            let mut state = self.login_state.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_flight() {
                tracing::error!("Can't login while trying to login");
                return Err(LoginError::AlreadySigningIn);
            }
            if let Some(token) = self.tokens().current() {
                self.progress(format_args!("Token loaded from {}", self.tokens().path().display()));
                return Ok(token);
            }
            *state = LoginState::Listening;
            LoginGuard {
                state: Arc::clone(&self.login_state),
            }
        };

        self.run_callback_server(port, login_timeout).await
    }

    /// Run [`login`](Self::login) on a background task and report
    /// `(success, token)` through `callback`.
    pub fn spawn_login<F>(&self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(bool, Option<String>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            match client.login().await {
                Ok(token) => callback(true, Some(token)),
                Err(e) => {
                    tracing::error!("Pavlok login failed: {e}");
                    callback(false, None);
                }
            }
        })
    }

    async fn run_callback_server(
        &self,
        port: u16,
        login_timeout: Option<Duration>,
    ) -> Result<String, LoginError> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .map_err(LoginError::Bind)?;
        let actual_port = listener.local_addr().map_err(LoginError::Bind)?.port();

        let redirect_uri = LocalOptions::callback_url(actual_port);
        let authorize_url = oauth::authorize_url(
            self.config().api_root(),
            &self.config().credentials.client_id,
            &redirect_uri,
        )
        .map_err(LoginError::Exchange)?;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let state = Arc::new(CallbackState {
            client: self.clone(),
            redirect_uri,
            authorize_url: authorize_url.to_string(),
            outcome: Mutex::new(Some(outcome_tx)),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = callback_router(Arc::clone(&state));
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!("Callback server error: {e}");
            }
            tracing::debug!("Callback server closed");
        });

        self.progress(format_args!("Server listening on port {actual_port}..."));
        let start_url = format!("http://localhost:{actual_port}/auth/pavlok");
        if let Err(e) = self.browser.open(&start_url) {
            tracing::warn!("Could not open a browser ({e}); visit {start_url} to sign in");
        }

        let outcome = match login_timeout {
            Some(limit) => match tokio::time::timeout(limit, outcome_rx).await {
                Ok(received) => received.unwrap_or(Err(LoginError::Interrupted)),
                Err(_) => Err(LoginError::TimedOut),
            },
            None => outcome_rx.await.unwrap_or(Err(LoginError::Interrupted)),
        };

        // Redirects arriving from here on must not start an exchange
        drop(state.claim());

        // Only a browser that reached the callback needs the done/error page
        if !matches!(
            outcome,
            Err(LoginError::TimedOut | LoginError::Interrupted)
        ) {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
        let _ = shutdown_tx.send(());
        if let Err(e) = server.await {
            tracing::error!("Callback server task failed: {e}");
        }

        outcome
    }
}

fn callback_router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/index.html") }))
        .route("/index.html", get(|| async { Html(INDEX_PAGE) }))
        .route("/auth/pavlok", get(start_auth))
        .route(LOCAL_CALLBACK_PATH, get(handle_result))
        .route("/done", get(|| async { Redirect::to("/done.html") }))
        .route("/done.html", get(|| async { Html(DONE_PAGE) }))
        .route("/error", get(|| async { Redirect::to("/error.html") }))
        .route("/error.html", get(|| async { Html(ERROR_PAGE) }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /auth/pavlok
async fn start_auth(State(state): State<Arc<CallbackState>>) -> Redirect {
    Redirect::to(&state.authorize_url)
}

/// GET /auth/pavlok/result
async fn handle_result(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(outcome) = state.claim() else {
        return Redirect::to("/done").into_response();
    };

    let Some(code) = params.code.filter(|code| !code.is_empty()) else {
        let _ = outcome.send(Err(LoginError::Rejected));
        return Html(REJECTED_PAGE).into_response();
    };

    state.client.advance_login_state(LoginState::Listening, LoginState::Exchanging);

    let token = match state.client.exchange_code(&code, &state.redirect_uri).await {
        Ok(response) => response.access_token,
        Err(e) => {
            tracing::error!("Token exchange failed: {e}");
            let _ = outcome.send(Err(LoginError::Exchange(e)));
            return Redirect::to("/error").into_response();
        }
    };

    if outcome.is_closed() {
        tracing::warn!("Login ended during the token exchange; discarding the token");
        return Redirect::to("/error").into_response();
    }

    if let Err(e) = state.client.tokens().save(&token) {
        tracing::error!("{e}");
        let _ = outcome.send(Err(LoginError::Storage(e)));
        return Redirect::to("/error").into_response();
    }

    if outcome.send(Ok(token)).is_err() {
        tracing::warn!("Login ended during the token exchange; discarding the token");
        if let Err(e) = state.client.tokens().clear() {
            tracing::error!("{e}");
        }
        return Redirect::to("/error").into_response();
    }

    state.client.progress(format_args!("Signed in to Pavlok"));
    Redirect::to("/done").into_response()
}

impl PavlokClient {
    fn advance_login_state(&self, from: LoginState, to: LoginState) {
        let mut state = self.login_state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
        }
    }
}

/// Login errors.
#[derive(Debug)]
pub enum LoginError {
    /// Login is only available in client mode
    WrongMode,
    /// Another login is still pending
    AlreadySigningIn,
    /// Couldn't start the callback server
    Bind(std::io::Error),
    /// The redirect carried no authorization code
    Rejected,
    Exchange(OAuthError),
    Storage(TokenError),
    /// No redirect arrived within the configured timeout
    TimedOut,
    /// The callback server went away before reporting
    Interrupted,
}

impl std::fmt::Display for LoginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginError::WrongMode => write!(f, "login is invalid when running as a server"),
            LoginError::AlreadySigningIn => write!(f, "already signing in"),
            LoginError::Bind(e) => write!(f, "could not start callback server: {e}"),
            LoginError::Rejected => write!(f, "authorization was rejected"),
            LoginError::Exchange(e) => write!(f, "{e}"),
            LoginError::Storage(e) => write!(f, "{e}"),
            LoginError::TimedOut => write!(f, "timed out waiting for authorization"),
            LoginError::Interrupted => write!(f, "login interrupted"),
        }
    }
}

impl std::error::Error for LoginError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_states() {
        assert!(!LoginState::Idle.in_flight());
        assert!(LoginState::Listening.in_flight());
        assert!(LoginState::Exchanging.in_flight());
        assert!(!LoginState::Closed.in_flight());
    }

    #[test]
    fn test_guard_closes_on_drop() {
        let state = Arc::new(Mutex::new(LoginState::Listening));
        drop(LoginGuard {
            state: Arc::clone(&state),
        });
        assert_eq!(*state.lock().unwrap(), LoginState::Closed);
    }
}
