//! OAuth2 authorization-code exchange against the Pavlok API.

use crate::config::Credentials;
use serde::Deserialize;

/// Build the URL the user is sent to for granting access.
pub fn authorize_url(
    api_root: &str,
    client_id: &str,
    redirect_uri: &str,
) -> Result<url::Url, OAuthError> {
    url::Url::parse_with_params(
        &format!("{api_root}/oauth/authorize"),
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
        ],
    )
    .map_err(|e| OAuthError::InvalidUrl(e.to_string()))
}

/// Successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// The complete response body, kept for server-mode sessions
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl TokenResponse {
    fn parse(body: &str) -> Result<Self, OAuthError> {
        let raw: serde_json::Value =
            serde_json::from_str(body).map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;
        let mut response: TokenResponse = serde_json::from_value(raw.clone())
            .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;
        response.raw = raw;
        Ok(response)
    }
}

/// Exchange an authorization code for an access token.
///
/// Makes exactly one attempt.
pub async fn exchange_code(
    http: &reqwest::Client,
    api_root: &str,
    credentials: &Credentials,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenResponse, OAuthError> {
    let response = http
        .post(format!("{api_root}/oauth/token"))
        .query(&[
            ("code", code),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await
        .map_err(|e| OAuthError::Network(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| OAuthError::Network(e.to_string()))?;

    if !status.is_success() {
        return Err(OAuthError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    TokenResponse::parse(&body)
}

/// OAuth errors.
#[derive(Debug)]
pub enum OAuthError {
    /// Transport failure talking to the token endpoint
    Network(String),
    /// Token endpoint answered with a non-success status
    Rejected { status: u16, body: String },
    /// Response body wasn't a token response
    InvalidResponse(String),
    InvalidUrl(String),
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OAuthError::Network(msg) => write!(f, "OAuth network error: {msg}"),
            OAuthError::Rejected { status, body } => {
                write!(f, "OAuth token request rejected ({status}): {body}")
            }
            OAuthError::InvalidResponse(msg) => write!(f, "Invalid OAuth token response: {msg}"),
            OAuthError::InvalidUrl(msg) => write!(f, "Invalid OAuth URL: {msg}"),
        }
    }
}

impl std::error::Error for OAuthError {}
