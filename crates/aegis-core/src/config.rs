//! Layered configuration for the orchestration core.
//!
//! Adapted from the teacher's `ConfigStore` (global file, project file,
//! environment, runtime, CLI-override layers merged global → project →
//! managed → env → runtime → cli) but narrowed to the fixed tunable set
//! listed in the external-interfaces configuration table.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;

/// The recognized tunables, each with the default named in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks_per_client: usize,
    pub max_retries: u32,
    pub step_timeout_ms: u64,
    pub permission_timeout_ms: u64,
    pub audit_retention_days: i64,
    pub health_check_interval_ms: u64,
    pub failure_threshold: u32,
    pub routing_cache_ttl_ms: u64,
    pub routing_confidence_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks_per_client: 5,
            max_retries: 2,
            step_timeout_ms: 30_000,
            permission_timeout_ms: 300_000,
            audit_retention_days: 30,
            health_check_interval_ms: 60_000,
            failure_threshold: 3,
            routing_cache_ttl_ms: 5 * 60_000,
            routing_confidence_threshold: 0.7,
        }
    }
}

/// Loads `OrchestratorConfig` from an optional project file layered under
/// environment variable overrides (`AEGIS_*` prefix, upper-snake-case field
/// names) and explicit runtime overrides supplied by the caller (e.g. CLI
/// flags). Layers merge shallowly in the order: defaults, file, env,
/// runtime.
pub struct ConfigStore {
    project_path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(project_path: Option<PathBuf>) -> Self {
        Self { project_path }
    }

    pub async fn load(&self, runtime_overrides: Option<Value>) -> anyhow::Result<OrchestratorConfig> {
        let mut merged = serde_json::to_value(OrchestratorConfig::default())?;

        if let Some(path) = &self.project_path {
            if let Ok(file_value) = read_json_file(path).await {
                deep_merge(&mut merged, &file_value);
            }
        }

        deep_merge(&mut merged, &env_layer());

        if let Some(overrides) = runtime_overrides {
            deep_merge(&mut merged, &overrides);
        }

        Ok(serde_json::from_value(merged)?)
    }
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let contents = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}

fn env_layer() -> Value {
    let mut map = Map::new();
    for (key, raw_value) in std::env::vars() {
        let Some(field) = key.strip_prefix("AEGIS_") else {
            continue;
        };
        let field = field.to_lowercase();
        let value = if let Ok(n) = raw_value.parse::<i64>() {
            Value::from(n)
        } else if let Ok(f) = raw_value.parse::<f64>() {
            Value::from(f)
        } else if let Ok(b) = raw_value.parse::<bool>() {
            Value::from(b)
        } else {
            Value::String(raw_value)
        };
        map.insert(field, value);
    }
    Value::Object(map)
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(
                    base_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
