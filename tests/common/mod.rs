//! Shared helpers for integration tests.

#![allow(dead_code)]

use pavlok::{BrowserOpener, Config, LocalOptions, PavlokClient};
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::MockServer;

/// Browser stand-in that hands opened URLs to the test.
pub struct RecordingBrowser {
    opened: mpsc::UnboundedSender<String>,
}

impl RecordingBrowser {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (opened, rx) = mpsc::unbounded_channel();
        (Self { opened }, rx)
    }
}

impl BrowserOpener for RecordingBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        let _ = self.opened.send(url.to_string());
        Ok(())
    }
}

pub fn token_path(dir: &TempDir) -> PathBuf {
    dir.path().join("pavlok-token.json")
}

/// Client-mode config pointed at the mock API, listening on a free port.
pub fn local_config(server: &MockServer, dir: &TempDir) -> Config {
    Config::new("client-id", "client-secret")
        .with_base_url(server.uri())
        .with_local_options(LocalOptions {
            port: 0,
            token_path: token_path(dir),
            save: true,
            login_timeout: None,
        })
}

pub fn local_client(server: &MockServer, dir: &TempDir) -> PavlokClient {
    PavlokClient::new(local_config(server, dir)).expect("valid config")
}

/// HTTP client that reports redirects instead of following them.
pub fn no_redirect_http() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to create HTTP client")
}

/// Rewrite `localhost` to the loopback address the callback server binds.
pub fn loopback(url: &str) -> String {
    url.replacen("localhost", "127.0.0.1", 1)
}
