//! Tokens persist between runs in `tokens.toml` next to the config file.

use std::path::{Path, PathBuf};

use printlink_core::TokenStore;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TokenFileError {
    #[error("token file: {0}")]
    Io(#[from] std::io::Error),
    #[error("token file: {0}")]
    Encode(#[from] toml::ser::Error),
}

pub fn default_path() -> Option<PathBuf> {
    crate::config::config_dir().map(|d| d.join("tokens.toml"))
}

/// Read the store. A missing file is an empty store; an unreadable one is logged and ignored.
pub fn load(path: &Path) -> TokenStore {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return TokenStore::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read token file");
            return TokenStore::new();
        }
    };
    toml::from_str(&text).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "ignoring malformed token file");
        TokenStore::new()
    })
}

pub fn save(path: &Path, store: &TokenStore) -> Result<(), TokenFileError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, toml::to_string(store)?)?;
    Ok(())
}
