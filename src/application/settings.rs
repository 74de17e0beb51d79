//! Shared settings document behind `/settings`.
//!
//! Handlers here never touch the cache; the route is wrapped by
//! `invalidate_on_write` instead.

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

pub const SETTINGS_TOPIC: &str = "settings";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings patch must be a JSON object")]
    NotAnObject,
}

#[derive(Clone, Default)]
pub struct SettingsService {
    document: Arc<RwLock<Map<String, Value>>>,
}

impl SettingsService {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            document: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self) -> Value {
        Value::Object(self.document.read().await.clone())
    }

    /// Merge top-level keys; a `null` value removes the key.
    pub async fn patch(&self, patch: Value) -> Result<Value, SettingsError> {
        let Value::Object(patch) = patch else {
            return Err(SettingsError::NotAnObject);
        };

        let mut document = self.document.write().await;
        for (key, value) in patch {
            if value.is_null() {
                document.remove(&key);
            } else {
                document.insert(key, value);
            }
        }
        Ok(Value::Object(document.clone()))
    }
}
