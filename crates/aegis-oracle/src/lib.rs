//! The `LanguageOracle` port: the narrow interface through which the
//! orchestration core asks an LLM to classify, plan, synthesize, or stream
//! text. Adapted from the teacher's `Provider`/`ProviderRegistry` pattern —
//! same trait-object-behind-a-registry shape, narrowed to the four
//! operations the core actually calls.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
#[cfg(test)]
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyResult {
    pub tool: String,
    pub confidence: f64,
    pub reasoning: Option<String>,
}

pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Three operations plus a streaming variant used only by the simple-query
/// path. Implementations are expected to suspend the caller for the
/// duration of the network call; the orchestrator treats each call as a
/// cancellation checkpoint.
#[async_trait]
pub trait LanguageOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(
        &self,
        message: &str,
        valid_tool_names: &[String],
    ) -> anyhow::Result<ClassifyResult>;

    async fn plan(&self, prompt_text: &str) -> anyhow::Result<String>;

    async fn synthesize(
        &self,
        query: &str,
        successes: &[(String, serde_json::Value)],
        failures: &[(String, String)],
    ) -> anyhow::Result<String>;

    /// Default implementation falls back to a single non-streamed chunk,
    /// mirroring the teacher's `Provider::stream` fallback onto `complete`.
    async fn stream(&self, message: &str, _conversation_history: &[String]) -> TextStream {
        let message = message.to_string();
        Box::pin(stream::once(async move { message }))
    }
}

/// Holds the configured oracle backends and the active default, mirroring
/// the teacher's `ProviderRegistry::select_provider` fallback chain:
/// explicit id → configured default → first available.
pub struct OracleRegistry {
    oracles: RwLock<HashMap<String, Arc<dyn LanguageOracle>>>,
    default_oracle: RwLock<Option<String>>,
}

impl Default for OracleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OracleRegistry {
    pub fn new() -> Self {
        Self {
            oracles: RwLock::new(HashMap::new()),
            default_oracle: RwLock::new(None),
        }
    }

    pub async fn register(&self, oracle: Arc<dyn LanguageOracle>, make_default: bool) {
        let name = oracle.name().to_string();
        self.oracles.write().await.insert(name.clone(), oracle);
        if make_default {
            *self.default_oracle.write().await = Some(name);
        } else {
            let mut default = self.default_oracle.write().await;
            if default.is_none() {
                *default = Some(name);
            }
        }
    }

    pub async fn get(&self, name: Option<&str>) -> anyhow::Result<Arc<dyn LanguageOracle>> {
        let oracles = self.oracles.read().await;
        if let Some(name) = name {
            return oracles
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("oracle '{name}' is not registered"));
        }
        if let Some(default_name) = self.default_oracle.read().await.as_ref() {
            if let Some(oracle) = oracles.get(default_name) {
                return Ok(oracle.clone());
            }
        }
        oracles
            .values()
            .next()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no language oracle is registered"))
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.oracles.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A deterministic, network-free oracle used for local testing and demos.
/// It classifies by simple keyword match against the tool catalog, "plans"
/// by emitting a single step naming a conversational fallback, and
/// synthesizes by concatenating successful results.
pub struct ScriptedOracle {
    name: String,
}

impl ScriptedOracle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl LanguageOracle for ScriptedOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(
        &self,
        message: &str,
        valid_tool_names: &[String],
    ) -> anyhow::Result<ClassifyResult> {
        let lower = message.to_lowercase();
        for tool in valid_tool_names {
            if lower.contains(&tool.to_lowercase()) {
                return Ok(ClassifyResult {
                    tool: tool.clone(),
                    confidence: 0.9,
                    reasoning: Some("keyword match".into()),
                });
            }
        }
        Ok(ClassifyResult {
            tool: "conversational".to_string(),
            confidence: 0.5,
            reasoning: Some("no keyword match".into()),
        })
    }

    async fn plan(&self, prompt_text: &str) -> anyhow::Result<String> {
        Ok(format!(
            r#"{{"steps": [{{"id": "step_1", "toolName": "conversational", "description": "respond to: {}", "parameters": {{}}, "dependencies": [], "requiresPermission": false, "parallelizable": true}}]}}"#,
            prompt_text.replace('"', "'")
        ))
    }

    async fn synthesize(
        &self,
        query: &str,
        successes: &[(String, serde_json::Value)],
        failures: &[(String, String)],
    ) -> anyhow::Result<String> {
        if successes.is_empty() {
            return Ok(format!(
                "I couldn't complete \"{query}\": {}",
                failures
                    .iter()
                    .map(|(tool, err)| format!("{tool} failed ({err})"))
                    .collect::<Vec<_>>()
                    .join("; ")
            ));
        }
        let rendered: Vec<String> = successes
            .iter()
            .map(|(tool, value)| format!("{tool}: {}", render_result(value)))
            .collect();
        Ok(rendered.join(". "))
    }

    async fn stream(&self, message: &str, _conversation_history: &[String]) -> TextStream {
        let sentences: Vec<String> = message
            .split_inclusive(['.', '!', '?'])
            .map(|s| s.to_string())
            .collect();
        Box::pin(stream::iter(sentences))
    }
}

/// Picks a human-readable rendering from a tool result following the
/// documented precedence: `formatted | answer | summary | message | content`,
/// else a JSON dump.
pub fn render_result(value: &serde_json::Value) -> String {
    for key in ["formatted", "answer", "summary", "message", "content"] {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            return s.to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_falls_back_to_first_available_oracle() {
        let registry = OracleRegistry::new();
        registry
            .register(Arc::new(ScriptedOracle::new("scripted")), false)
            .await;
        let oracle = registry.get(None).await.unwrap();
        assert_eq!(oracle.name(), "scripted");
    }

    #[tokio::test]
    async fn registry_errors_on_unknown_explicit_name() {
        let registry = OracleRegistry::new();
        registry
            .register(Arc::new(ScriptedOracle::new("scripted")), true)
            .await;
        let result = registry.get(Some("missing")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn scripted_classify_matches_keyword() {
        let oracle = ScriptedOracle::new("scripted");
        let tools = vec!["weather".to_string(), "news".to_string()];
        let result = oracle
            .classify("What's the weather like?", &tools)
            .await
            .unwrap();
        assert_eq!(result.tool, "weather");
    }

    #[tokio::test]
    async fn scripted_synthesize_falls_back_on_all_failures() {
        let oracle = ScriptedOracle::new("scripted");
        let text = oracle
            .synthesize("query", &[], &[("weather".to_string(), "timeout".to_string())])
            .await
            .unwrap();
        assert!(text.contains("weather failed"));
    }

    #[tokio::test]
    async fn scripted_stream_splits_on_sentence_boundaries() {
        let oracle = ScriptedOracle::new("scripted");
        let mut stream = oracle.stream("Hi there! How are you?", &[]).await;
        let first = stream.next().await.unwrap();
        assert_eq!(first, "Hi there!");
    }
}
