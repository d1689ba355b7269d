//! Single-tool fast-path decision with caching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_oracle::OracleRegistry;
use aegis_tools::PluginRegistry;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub tool_name: String,
    pub confidence: f64,
    pub from_cache: bool,
}

struct CacheEntry {
    decision: RoutingDecision,
    inserted_at: Instant,
}

pub struct RoutingClassifier {
    oracle_registry: Arc<OracleRegistry>,
    plugin_registry: Arc<PluginRegistry>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    confidence_threshold: f64,
}

const SIMILARITY_MATCH_THRESHOLD: f64 = 0.75;
const SIMILAR_CONFIDENCE_FLOOR: f64 = 0.85;
const SIMILARITY_CONFIDENCE_DISCOUNT: f64 = 0.95;

impl RoutingClassifier {
    pub fn new(
        oracle_registry: Arc<OracleRegistry>,
        plugin_registry: Arc<PluginRegistry>,
        ttl_ms: u64,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            oracle_registry,
            plugin_registry,
            cache: RwLock::new(HashMap::new()),
            ttl: Duration::from_millis(ttl_ms),
            confidence_threshold,
        }
    }

    /// 1. Exact cache hit. 2. Lexically similar prior message with high
    /// confidence. 3. Oracle classification, validated against the current
    /// tool set plus the synthetic `conversational`/`general_search` names,
    /// then cached.
    pub async fn classify(&self, message: &str) -> anyhow::Result<RoutingDecision> {
        self.sweep_expired().await;

        if let Some(decision) = self.cache_lookup(message).await {
            return Ok(RoutingDecision {
                from_cache: true,
                ..decision
            });
        }

        if let Some((similar_decision, similarity)) = self.most_similar(message).await {
            if similarity >= SIMILARITY_MATCH_THRESHOLD
                && similar_decision.confidence >= SIMILAR_CONFIDENCE_FLOOR
            {
                let decision = RoutingDecision {
                    tool_name: similar_decision.tool_name,
                    confidence: similar_decision.confidence * SIMILARITY_CONFIDENCE_DISCOUNT,
                    from_cache: false,
                };
                self.insert(message, decision.clone()).await;
                return Ok(decision);
            }
        }

        let mut valid_tools = self.plugin_registry.names().await;
        valid_tools.push("conversational".to_string());
        valid_tools.push("general_search".to_string());

        let oracle = self.oracle_registry.get(None).await?;
        let result = oracle.classify(message, &valid_tools).await?;

        let oracle_tool_was_valid = valid_tools.contains(&result.tool);
        let tool_name = if oracle_tool_was_valid {
            result.tool
        } else {
            "conversational".to_string()
        };
        let confidence = if oracle_tool_was_valid {
            result.confidence.clamp(0.0, 1.0)
        } else {
            0.5
        };

        let decision = RoutingDecision {
            tool_name,
            confidence,
            from_cache: false,
        };
        self.insert(message, decision.clone()).await;
        Ok(decision)
    }

    pub fn should_route_directly(&self, decision: &RoutingDecision) -> bool {
        decision.confidence >= self.confidence_threshold
    }

    async fn cache_lookup(&self, message: &str) -> Option<RoutingDecision> {
        let cache = self.cache.read().await;
        let entry = cache.get(message)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.decision.clone())
    }

    async fn most_similar(&self, message: &str) -> Option<(RoutingDecision, f64)> {
        let cache = self.cache.read().await;
        let tokens = tokenize(message);
        cache
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() <= self.ttl)
            .map(|(key, entry)| (entry.decision.clone(), jaccard_similarity(&tokens, &tokenize(key))))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    async fn insert(&self, message: &str, decision: RoutingDecision) {
        let mut cache = self.cache.write().await;
        cache.insert(
            message.to_string(),
            CacheEntry {
                decision,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Periodic TTL sweep; also run lazily on lookup.
    pub async fn sweep_expired(&self) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
    }
}

fn tokenize(message: &str) -> Vec<String> {
    message
        .to_lowercase()
        .split_whitespace()
        .map(|s| s.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn jaccard_similarity(a: &[String], b: &[String]) -> f64 {
    use std::collections::HashSet;
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_oracle::ScriptedOracle;

    async fn classifier() -> RoutingClassifier {
        let oracle_registry = Arc::new(OracleRegistry::new());
        oracle_registry
            .register(Arc::new(ScriptedOracle::new("scripted")), true)
            .await;
        RoutingClassifier::new(oracle_registry, Arc::new(PluginRegistry::new()), 60_000, 0.7)
    }

    #[tokio::test]
    async fn second_identical_call_reports_cache_hit() {
        let classifier = classifier().await;
        let first = classifier.classify("what's the weather").await.unwrap();
        assert!(!first.from_cache);
        let second = classifier.classify("what's the weather").await.unwrap();
        assert!(second.from_cache);
        assert_eq!(first.tool_name, second.tool_name);
        assert_eq!(first.confidence, second.confidence);
    }

    #[tokio::test]
    async fn should_route_directly_respects_threshold() {
        let classifier = classifier().await;
        let high = RoutingDecision {
            tool_name: "weather".into(),
            confidence: 0.9,
            from_cache: false,
        };
        let low = RoutingDecision {
            tool_name: "weather".into(),
            confidence: 0.2,
            from_cache: false,
        };
        assert!(classifier.should_route_directly(&high));
        assert!(!classifier.should_route_directly(&low));
    }

    #[test]
    fn jaccard_similarity_of_identical_token_sets_is_one() {
        let a = tokenize("what is the weather");
        let b = tokenize("what is the weather");
        assert_eq!(jaccard_similarity(&a, &b), 1.0);
    }
}
