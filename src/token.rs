//! Access token persistence.
//!
//! The token lives in a single JSON file (`{ "token": "..." }`) and is cached
//! in memory. Only one token is active per store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// On-disk token record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFile {
    pub token: Option<String>,
}

/// Token persistence errors.
///
/// These are fatal for the operation that hit them: with saving enabled the
/// client can't proceed without a writable token store.
#[derive(Debug)]
pub enum TokenError {
    /// Couldn't write the token file
    Save { path: PathBuf, source: std::io::Error },
    /// Couldn't delete the token file
    Clear { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Save { path, source } => {
                write!(f, "Can't save Pavlok auth token to {}: {source}", path.display())
            }
            TokenError::Clear { path, source } => {
                write!(f, "Couldn't delete auth token at {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenError::Save { source, .. } | TokenError::Clear { source, .. } => Some(source),
        }
    }
}

/// File-backed token cache.
#[derive(Debug)]
pub struct TokenStore {
    current: RwLock<Option<String>>,
    path: PathBuf,
    save: bool,
}

impl TokenStore {
    /// Open the store at `path`, loading any token already on disk.
    ///
    /// The file is read whether or not saving is enabled. A missing or
    /// unreadable file yields an empty store; with saving enabled a skeleton
    /// `{ "token": null }` file is created so later writes have a target.
    pub fn open(path: impl Into<PathBuf>, save: bool) -> Self {
        let path = path.into();
        let current = match read_token_file(&path) {
            Ok(file) => file.token,
            Err(e) => {
                tracing::debug!("No usable token file at {}: {e}", path.display());
                if save {
                    if let Err(e) = write_token_file(&path, &TokenFile::default()) {
                        tracing::warn!("Could not create token file {}: {e}", path.display());
                    }
                }
                None
            }
        };

        Self {
            current: RwLock::new(current),
            path,
            save,
        }
    }

    /// An empty store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(None),
            path: PathBuf::new(),
            save: false,
        }
    }

    /// The cached token, if any.
    pub fn current(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_token(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Cache `token` and persist it when saving is enabled.
    pub fn save(&self, token: &str) -> Result<(), TokenError> {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());

        if self.save {
            let file = TokenFile {
                token: Some(token.to_string()),
            };
            write_token_file(&self.path, &file).map_err(|source| TokenError::Save {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Forget the token and delete the token file when saving is enabled.
    pub fn clear(&self) -> Result<(), TokenError> {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;

        if self.save {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(TokenError::Clear {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save_enabled(&self) -> bool {
        self.save
    }
}

fn read_token_file(path: &Path) -> std::io::Result<TokenFile> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(std::io::Error::other)
}

fn write_token_file(path: &Path, file: &TokenFile) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(file).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}
