//! Pavlok client - OAuth login and stimulus calls for the Pavlok wearable API.
//!
//! This library signs a user in through the OAuth2 authorization-code flow
//! and sends beeps, vibrations, shocks and patterns to their device.
//!
//! # Modes
//!
//! - **Client mode**: `login()` starts a short-lived local callback server,
//!   opens the browser, and saves the access token to a JSON file.
//! - **Server mode** (`server` feature): [`EmbeddedAuth`] provides the
//!   callback route for an existing axum application and keeps tokens in
//!   user sessions.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         PavlokClient                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌─────────┐   ┌──────────────┐   ┌────────────┐              │
//! │  │ Config  │──▶│ login / OAuth│──▶│ TokenStore │              │
//! │  └─────────┘   │   exchange   │   │  (file)    │              │
//! │                └──────────────┘   └─────┬──────┘              │
//! │                                         ▼                     │
//! │                                  ┌────────────┐               │
//! │                                  │ Dispatcher │──▶ Pavlok API │
//! │                                  └────────────┘               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pavlok::{Config, PavlokClient, StimulusRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PavlokClient::new(Config::new("client-id", "client-secret"))?;
//! client.login().await?;
//!
//! let message = client.vibrate(StimulusRequest::new(100)).await?;
//! println!("{message}"); // "vibration sent."
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod login;
pub mod oauth;
pub mod stimulus;
pub mod token;

#[cfg(feature = "server")]
pub mod embedded;

// Re-export key types at crate root for convenience
pub use client::{into_outcome, ApiError, PavlokClient, StepsQuery};
pub use config::{Config, ConfigError, Credentials, LocalOptions, Mode, ServerOptions};
pub use login::{BrowserOpener, LoginError, LoginState, SystemBrowser};
pub use oauth::{OAuthError, TokenResponse};
pub use stimulus::{Stimulus, StimulusKind, StimulusRequest, ValidationError};
pub use token::{TokenError, TokenFile, TokenStore};

#[cfg(feature = "server")]
pub use embedded::{EmbeddedAuth, MemorySessionStore, PavlokSession, SessionId, SessionStore};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
