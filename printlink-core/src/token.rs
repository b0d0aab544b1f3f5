//! Per-device authorization tokens. Owned by the host; persistence is the host's business.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Device id -> token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenStore {
    tokens: BTreeMap<String, String>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<&str> {
        self.tokens.get(device_id).map(String::as_str)
    }

    /// Store a token. Returns true if the stored value changed. Empty tokens clear the entry.
    pub fn set(&mut self, device_id: &str, token: &str) -> bool {
        if token.is_empty() {
            return self.remove(device_id);
        }
        if self.get(device_id) == Some(token) {
            return false;
        }
        self.tokens.insert(device_id.to_string(), token.to_string());
        true
    }

    /// Forget a token. Returns true if one was stored.
    pub fn remove(&mut self, device_id: &str) -> bool {
        self.tokens.remove(device_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
