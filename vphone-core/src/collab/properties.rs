//! External property manager.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::VpError;

/// Key/value settings persisted outside the core.
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), VpError>;
    fn keys(&self) -> Vec<String>;
}

/// Well-known property keys.
pub mod keys {
    pub const MAX_CALLS: &str = "MaxCalls";
    pub const AUTO_REJECT: &str = "AutoReject";
    pub const ALLOW_INCOMING_CALLS: &str = "AllowIncomingCalls";
    pub const LOCAL_NAME: &str = "LocalName";
    pub const LOCAL_NUMBER: &str = "LocalNumber";
}

/// In-memory store, optionally with read-only keys.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<BTreeMap<String, String>>,
    read_only: Vec<String>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: Mutex::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            read_only: Vec::new(),
        }
    }

    pub fn read_only(mut self, key: impl Into<String>) -> Self {
        self.read_only.push(key.into());
        self
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), VpError> {
        if key.is_empty() {
            return Err(VpError::InvalidParameter("empty property key"));
        }
        if self.read_only.iter().any(|k| k == key) {
            return Err(VpError::Setting(format!("{key} is read-only")));
        }
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }
}
