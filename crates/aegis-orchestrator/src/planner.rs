//! Decomposes a query into an `ExecutionPlan`. Two modes: a fast-track regex
//! family for a handful of common intents, and full LLM planning via the
//! `LanguageOracle.plan` operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use aegis_oracle::OracleRegistry;
use aegis_tools::PluginRegistry;
use aegis_types::{ExecutionPlan, ExecutionStep, OrchestratorError};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Narrow interface the Executor calls into for mid-run revision, owned by
/// the Orchestrator and passed into the Executor rather than the Executor
/// importing the Planner directly — breaks the planner/executor import
/// cycle the source codebase resolved with a lazy import.
#[async_trait]
pub trait PlanReviser: Send + Sync {
    async fn revise(
        &self,
        plan: &ExecutionPlan,
        context_message: &str,
        completed_step_ids: &HashSet<String>,
    ) -> RevisionOutcome;
}

pub enum RevisionOutcome {
    Cancel,
    Continue(ExecutionPlan),
    Revised(ExecutionPlan),
}

pub struct Planner {
    oracle_registry: Arc<OracleRegistry>,
    plugin_registry: Arc<PluginRegistry>,
    weather_re: Regex,
    news_re: Regex,
    arithmetic_re: Regex,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: HashMap<String, Value>,
    #[serde(default)]
    dependencies: HashSet<String>,
    #[serde(default, rename = "requiresPermission")]
    requires_permission: bool,
    #[serde(default = "default_true", rename = "parallelizable")]
    parallelizable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum RawRevision {
    Cancel,
    Continue,
    #[serde(untagged)]
    NewSteps(RawPlan),
}

const MEMORY_CATEGORY: &str = "memory";

impl Planner {
    pub fn new(oracle_registry: Arc<OracleRegistry>, plugin_registry: Arc<PluginRegistry>) -> Self {
        Self {
            oracle_registry,
            plugin_registry,
            weather_re: Regex::new(r"(?i)weather(?:\s+(?:in|for)\s+([a-zA-Z\s]+))?").unwrap(),
            news_re: Regex::new(r"(?i)(?:latest\s+)?(\d+)?\s*news(?:\s+headlines)?").unwrap(),
            arithmetic_re: Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*([+\-*/])\s*(-?\d+(?:\.\d+)?)\s*$")
                .unwrap(),
        }
    }

    pub async fn plan(&self, query: &str, conversation_history: &[String]) -> Result<ExecutionPlan, OrchestratorError> {
        if let Some(plan) = self.fast_track(query).await {
            return Ok(plan);
        }
        self.plan_with_oracle(query, conversation_history).await
    }

    async fn fast_track(&self, query: &str) -> Option<ExecutionPlan> {
        if let Some(captures) = self.weather_re.captures(query) {
            if self.plugin_registry.contains("weather").await {
                let mut parameters = HashMap::new();
                if let Some(city) = captures.get(1) {
                    parameters.insert(
                        "city".to_string(),
                        Value::String(city.as_str().trim().to_string()),
                    );
                }
                return Some(self.single_step_plan(query, "weather", parameters));
            }
        }
        if self.news_re.is_match(query) {
            if self.plugin_registry.contains("news").await {
                let mut parameters = HashMap::new();
                if let Some(captures) = self.news_re.captures(query) {
                    if let Some(count) = captures.get(1) {
                        if let Ok(n) = count.as_str().parse::<u64>() {
                            parameters.insert("count".to_string(), Value::from(n));
                        }
                    }
                }
                return Some(self.single_step_plan(query, "news", parameters));
            }
        }
        if let Some(captures) = self.arithmetic_re.captures(query) {
            if self.plugin_registry.contains("calculator").await {
                let mut parameters = HashMap::new();
                parameters.insert("lhs".to_string(), Value::String(captures[1].to_string()));
                parameters.insert("operator".to_string(), Value::String(captures[2].to_string()));
                parameters.insert("rhs".to_string(), Value::String(captures[3].to_string()));
                return Some(self.single_step_plan(query, "calculator", parameters));
            }
        }
        None
    }

    fn single_step_plan(
        &self,
        query: &str,
        tool_name: &str,
        parameters: HashMap<String, Value>,
    ) -> ExecutionPlan {
        let step = ExecutionStep {
            id: "step_1".to_string(),
            tool_name: tool_name.to_string(),
            description: format!("invoke {tool_name}"),
            parameters,
            dependencies: HashSet::new(),
            requires_permission: false,
            parallelizable: false,
            estimated_duration_ms: None,
        };
        ExecutionPlan {
            id: Uuid::new_v4().to_string(),
            query: query.to_string(),
            steps: vec![step],
            requires_user_permission: false,
            created_at: Utc::now(),
            estimated_total_duration_ms: 1000,
        }
    }

    async fn plan_with_oracle(
        &self,
        query: &str,
        conversation_history: &[String],
    ) -> Result<ExecutionPlan, OrchestratorError> {
        let catalog = self.plugin_registry.catalog().await;
        let prompt = build_planning_prompt(query, conversation_history, &catalog);

        let oracle = self
            .oracle_registry
            .get(None)
            .await
            .map_err(|e| OrchestratorError::Oracle { detail: e.to_string() })?;
        let raw_text = oracle
            .plan(&prompt)
            .await
            .map_err(|e| OrchestratorError::Oracle { detail: e.to_string() })?;

        let raw_plan = parse_plan_json(&raw_text)?;
        self.build_plan(query, raw_plan).await
    }

    async fn build_plan(&self, query: &str, raw_plan: RawPlan) -> Result<ExecutionPlan, OrchestratorError> {
        let memory_tools: HashSet<String> = self
            .plugin_registry
            .catalog()
            .await
            .into_iter()
            .filter(|t| t.category == MEMORY_CATEGORY)
            .map(|t| t.name)
            .collect();

        let mut steps = Vec::new();
        for (index, raw) in raw_plan.steps.into_iter().enumerate() {
            let id = raw.id.unwrap_or_else(|| format!("step_{}", index + 1));
            let requires_permission = if memory_tools.contains(&raw.tool_name) {
                false
            } else {
                raw.requires_permission
            };
            steps.push(ExecutionStep {
                description: raw
                    .description
                    .unwrap_or_else(|| format!("invoke {}", raw.tool_name)),
                id,
                tool_name: raw.tool_name,
                parameters: raw.parameters,
                dependencies: raw.dependencies,
                requires_permission,
                parallelizable: raw.parallelizable,
                estimated_duration_ms: None,
            });
        }

        let requires_user_permission = steps.iter().any(|s| s.requires_permission);
        let depth = critical_path_depth(&steps);

        let plan = ExecutionPlan {
            id: Uuid::new_v4().to_string(),
            query: query.to_string(),
            steps,
            requires_user_permission,
            created_at: Utc::now(),
            estimated_total_duration_ms: (depth as u64 + 1) * 1000,
        };

        if !plan.is_acyclic() {
            return Err(OrchestratorError::PlanStructure {
                detail: "step dependency graph contains a cycle".to_string(),
            });
        }

        Ok(plan)
    }
}

#[async_trait]
impl PlanReviser for Planner {
    /// Asks the oracle to return cancel/continue/new-steps. Any parse or
    /// transport failure falls back to returning the original plan — never
    /// cancel on error.
    async fn revise(
        &self,
        plan: &ExecutionPlan,
        context_message: &str,
        completed_step_ids: &HashSet<String>,
    ) -> RevisionOutcome {
        let prompt = build_revision_prompt(plan, context_message, completed_step_ids);

        let Ok(oracle) = self.oracle_registry.get(None).await else {
            return RevisionOutcome::Continue(plan.clone());
        };
        let Ok(raw_text) = oracle.plan(&prompt).await else {
            return RevisionOutcome::Continue(plan.clone());
        };

        match serde_json::from_str::<RawRevision>(strip_fences(&raw_text)) {
            Ok(RawRevision::Cancel) => RevisionOutcome::Cancel,
            Ok(RawRevision::Continue) => RevisionOutcome::Continue(plan.clone()),
            Ok(RawRevision::NewSteps(raw_plan)) => {
                let residual_query = format!("{} (revised: {})", plan.query, context_message);
                match self.build_plan(&residual_query, raw_plan).await {
                    Ok(new_plan) => RevisionOutcome::Revised(new_plan),
                    Err(_) => RevisionOutcome::Continue(plan.clone()),
                }
            }
            Err(_) => RevisionOutcome::Continue(plan.clone()),
        }
    }
}

fn build_planning_prompt(
    query: &str,
    conversation_history: &[String],
    catalog: &[aegis_types::Tool],
) -> String {
    let tool_lines: Vec<String> = catalog
        .iter()
        .map(|t| {
            let params: Vec<String> = t
                .parameters
                .iter()
                .map(|p| format!("{}:{}{}", p.name, p.param_type, if p.required { "*" } else { "" }))
                .collect();
            format!("- {} ({}): {} [{}]", t.name, t.category, t.description, params.join(", "))
        })
        .collect();
    format!(
        "query: {query}\nhistory: {}\ntools:\n{}\nreturn a json object with a steps array.",
        conversation_history.join(" | "),
        tool_lines.join("\n")
    )
}

fn build_revision_prompt(
    plan: &ExecutionPlan,
    context_message: &str,
    completed_step_ids: &HashSet<String>,
) -> String {
    format!(
        "plan: {}\ncontext update: {context_message}\ncompleted steps: {}\nreturn {{action:\"cancel\"}}, {{action:\"continue\"}}, or a new steps array.",
        plan.id,
        completed_step_ids.iter().cloned().collect::<Vec<_>>().join(",")
    )
}

fn parse_plan_json(raw_text: &str) -> Result<RawPlan, OrchestratorError> {
    serde_json::from_str(strip_fences(raw_text)).map_err(|e| OrchestratorError::PlanParse {
        detail: e.to_string(),
    })
}

/// Tolerates fenced-code (```json ... ```) and bare-object forms.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end >= start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

fn critical_path_depth(steps: &[ExecutionStep]) -> usize {
    let mut memo: HashMap<&str, usize> = HashMap::new();
    fn depth_of<'a>(
        id: &'a str,
        steps: &'a [ExecutionStep],
        memo: &mut HashMap<&'a str, usize>,
    ) -> usize {
        if let Some(&d) = memo.get(id) {
            return d;
        }
        let Some(step) = steps.iter().find(|s| s.id == id) else {
            return 0;
        };
        let depth = step
            .dependencies
            .iter()
            .map(|dep| depth_of(dep, steps, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(id, depth);
        depth
    }
    steps
        .iter()
        .map(|s| depth_of(&s.id, steps, &mut memo))
        .max()
        .unwrap_or(0)
}
