//! Configuration for the Pavlok client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default Pavlok API host.
pub const DEFAULT_BASE_URL: &str = "http://pavlok-mvp.herokuapp.com";

/// Default port for the local OAuth callback server.
pub const DEFAULT_PORT: u16 = 3000;

/// Default message sent along with stimuli.
pub const DEFAULT_MESSAGE: &str = "Sent from the Pavlok Rust client.";

/// Default name of the token file.
pub const TOKEN_FILENAME: &str = "pavlok-token.json";

/// Path of the OAuth redirect handled by the local callback server.
pub const LOCAL_CALLBACK_PATH: &str = "/auth/pavlok/result";

/// OAuth2 client credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Main configuration for a [`PavlokClient`](crate::PavlokClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OAuth2 client credentials
    pub credentials: Credentials,

    /// Pavlok API to query
    pub base_url: String,

    /// Promote progress messages from debug to info level
    pub verbose: bool,

    /// Message sent with stimuli when a request doesn't carry one
    pub default_message: String,

    /// Standalone client or embedded server
    pub mode: Mode,
}

/// How the client obtains its access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mode {
    /// Spin up a local callback server and keep the token on disk.
    Client(LocalOptions),
    /// Mount the callback route in the caller's application and keep
    /// tokens in the caller's sessions.
    Server(ServerOptions),
}

/// Options for client mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalOptions {
    /// Port for the local callback server (0 picks a free one)
    pub port: u16,

    /// Where the access token is persisted
    pub token_path: PathBuf,

    /// Whether to save the token between runs
    pub save: bool,

    /// Give up waiting for the OAuth redirect after this long
    #[serde(default, with = "option_duration_secs")]
    pub login_timeout: Option<Duration>,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token_path: Config::data_dir().join(TOKEN_FILENAME),
            save: true,
            login_timeout: None,
        }
    }
}

impl LocalOptions {
    /// Callback URL registered with the OAuth client for a given port.
    pub fn callback_url(port: u16) -> String {
        format!("http://localhost:{port}{LOCAL_CALLBACK_PATH}")
    }
}

/// Options for server mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Absolute callback URL associated with the client credentials
    pub callback_url: String,

    /// Path of the callback URL relative to the application root
    pub callback_path: String,

    /// Optional path that redirects to the Pavlok authorize page
    #[serde(default)]
    pub auth_path: Option<String>,

    /// Redirect target after a successful authorization
    pub success_path: String,

    /// Redirect target after a failed authorization
    pub failure_path: String,

    /// Append `?code={token}` to the success redirect
    #[serde(default)]
    pub success_with_code: bool,

    /// Issue and verify a session cookie; when false the application must
    /// insert a session id extension itself
    pub handle_sessions: bool,

    /// Secret used to sign session cookies
    pub session_secret: String,
}

impl ServerOptions {
    pub fn new(callback_url: impl Into<String>, callback_path: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
            callback_path: callback_path.into(),
            auth_path: None,
            success_path: "/".to_string(),
            failure_path: "/error".to_string(),
            success_with_code: false,
            handle_sessions: true,
            session_secret: String::new(),
        }
    }
}

impl Config {
    /// Create a client-mode configuration with default options.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(client_id, client_secret),
            base_url: DEFAULT_BASE_URL.to_string(),
            verbose: false,
            default_message: DEFAULT_MESSAGE.to_string(),
            mode: Mode::Client(LocalOptions::default()),
        }
    }

    /// Create a server-mode configuration.
    pub fn server(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        options: ServerOptions,
    ) -> Self {
        Self {
            mode: Mode::Server(options),
            ..Self::new(client_id, client_secret)
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.default_message = message.into();
        self
    }

    pub fn with_local_options(mut self, options: LocalOptions) -> Self {
        self.mode = Mode::Client(options);
        self
    }

    /// Local options, if in client mode.
    pub fn local(&self) -> Option<&LocalOptions> {
        match &self.mode {
            Mode::Client(options) => Some(options),
            Mode::Server(_) => None,
        }
    }

    /// Server options, if in server mode.
    pub fn server_options(&self) -> Option<&ServerOptions> {
        match &self.mode {
            Mode::Server(options) => Some(options),
            Mode::Client(_) => None,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self.mode, Mode::Server(_))
    }

    /// API base URL without a trailing slash.
    pub fn api_root(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Check that the configuration is usable.
    ///
    /// Failures are logged before being returned so that callers which only
    /// abort on error still leave a trace of why.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let result = self.check();
        if let Err(e) = &result {
            tracing::error!("Invalid Pavlok configuration: {e}");
        }
        result
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.credentials.client_id.trim().is_empty()
            || self.credentials.client_secret.trim().is_empty()
        {
            return Err(ConfigError::MissingCredentials);
        }
        if url::Url::parse(&self.base_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "base_url '{}' is not a valid URL",
                self.base_url
            )));
        }

        if let Mode::Server(options) = &self.mode {
            if options.callback_url.trim().is_empty() {
                return Err(ConfigError::MissingOption("callback_url"));
            }
            if options.callback_path.trim().is_empty() {
                return Err(ConfigError::MissingOption("callback_path"));
            }
            for (name, path) in [
                ("callback_path", Some(&options.callback_path)),
                ("auth_path", options.auth_path.as_ref()),
            ] {
                if path.is_some_and(|p| !p.starts_with('/')) {
                    return Err(ConfigError::Invalid(format!("{name} must start with '/'")));
                }
            }
            for (name, target) in [
                ("success_path", &options.success_path),
                ("failure_path", &options.failure_path),
            ] {
                if axum::http::HeaderValue::from_str(target).is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "{name} is not a valid redirect target"
                    )));
                }
            }
            if options.handle_sessions && options.session_secret.is_empty() {
                return Err(ConfigError::MissingOption("session_secret"));
            }
        }
        Ok(())
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a file, `None` if it doesn't exist.
    pub fn load_from(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(Some(config))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pavlok")
            .join("config.json")
    }

    /// Directory holding the token file by default.
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pavlok")
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    MissingCredentials,
    MissingOption(&'static str),
    Invalid(String),
    IoError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingCredentials => write!(f, "No client ID or client secret provided"),
            ConfigError::MissingOption(name) => {
                write!(f, "{name} must be set for server mode; there is no default value")
            }
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for an optional Duration stored as whole seconds.
mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
