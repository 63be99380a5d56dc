//! Kernelspecs and kernel records returned by the lifecycle API.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::KernelId;

/// Descriptor naming a kernel type and its launch parameters.
///
/// `spec` holds the descriptor fields (`display_name`, `language`, `argv`,
/// ...) verbatim. A requested spec only constrains the fields it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    #[serde(default)]
    pub spec: IndexMap<String, Value>,
}

impl KernelSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: IndexMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.spec.insert(key.into(), value);
        self
    }

    /// True when `advertised` has the same name and every field of `self`
    /// equals the corresponding advertised field.
    pub fn is_compatible_with(&self, advertised: &KernelSpec) -> bool {
        self.name == advertised.name
            && self
                .spec
                .iter()
                .all(|(key, value)| advertised.spec.get(key) == Some(value))
    }
}

/// A running kernel as reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRecord {
    pub id: KernelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connections: u32,
}
