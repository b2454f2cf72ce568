//! Per-call request values. Never persisted.

use crate::lifecycle::status::OperationKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Operation-specific form input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormData {
    /// Form fields keyed by env variable name. Becomes the app's config and env file.
    #[serde(default)]
    pub values: Map<String, JsonValue>,
    /// Update only: snapshot data and bundle before rewriting the bundle.
    #[serde(default)]
    pub backup: bool,
}

impl FormData {
    pub fn with_values(values: Map<String, JsonValue>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    pub fn config(&self) -> JsonValue {
        JsonValue::Object(self.values.clone())
    }

    /// Parse `KEY=VALUE` pairs as given on the command line.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = Map::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", pair))?;
            let key = k.trim();
            if key.is_empty() {
                return Err(format!("empty key in '{}'", pair));
            }
            values.insert(key.to_string(), JsonValue::String(v.to_string()));
        }
        Ok(Self::with_values(values))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRequest {
    pub app_id: String,
    pub operation: OperationKind,
    #[serde(default)]
    pub form: FormData,
}

impl LifecycleRequest {
    pub fn new(app_id: impl Into<String>, operation: OperationKind, form: FormData) -> Self {
        Self {
            app_id: app_id.into(),
            operation,
            form,
        }
    }
}
