//! DAG scheduler: runs a plan's steps respecting dependency order, fans out
//! parallel-safe steps, retries with backoff, and synthesizes a final answer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aegis_core::{AuditLog, EventBus, PermissionGate};
use aegis_oracle::OracleRegistry;
use aegis_tools::{ExecutionContext, PluginRegistry};
use aegis_types::{
    AuditEventKind, Event, EventPriority, ExecutionPlan, ExecutionStep, OrchestratorError,
    PermissionLevel, PlanExecution, PlanStatus, StepExecution, StepStatus,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::planner::{PlanReviser, RevisionOutcome};

const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

pub struct Executor {
    event_bus: EventBus,
    audit_log: Arc<AuditLog>,
    permission_gate: Arc<PermissionGate>,
    plugin_registry: Arc<PluginRegistry>,
    oracle_registry: Arc<OracleRegistry>,
    reviser: Arc<dyn PlanReviser>,
    max_retries: u32,
    step_timeout_ms: u64,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_bus: EventBus,
        audit_log: Arc<AuditLog>,
        permission_gate: Arc<PermissionGate>,
        plugin_registry: Arc<PluginRegistry>,
        oracle_registry: Arc<OracleRegistry>,
        reviser: Arc<dyn PlanReviser>,
        max_retries: u32,
    ) -> Self {
        Self {
            event_bus,
            audit_log,
            permission_gate,
            plugin_registry,
            oracle_registry,
            reviser,
            max_retries,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
        }
    }

    pub fn with_step_timeout_ms(mut self, ms: u64) -> Self {
        self.step_timeout_ms = ms;
        self
    }

    /// Runs `plan` to completion. `context_updates` is drained (non-blocking)
    /// between scheduling batches to allow mid-run revision; pass a closed
    /// channel if the caller has no live updates to feed in.
    pub async fn execute(
        &self,
        client_id: &str,
        plan: ExecutionPlan,
        conversation_history: &[String],
        mut context_updates: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) -> Result<(PlanExecution, String), OrchestratorError> {
        let _ = self
            .audit_log
            .log(
                client_id,
                AuditEventKind::ExecutionStarted,
                json!({"plan_id": plan.id, "query": plan.query}),
                Some(plan.id.clone()),
                None,
            )
            .await;
        self.publish_progress(&plan.id, 0).await;

        let mut current_plan = plan;
        let mut execution = PlanExecution {
            plan_id: current_plan.id.clone(),
            client_id: client_id.to_string(),
            status: PlanStatus::Running,
            steps: current_plan
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepExecution::pending(s.id.clone())))
                .collect(),
            results: HashMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            progress_log: Vec::new(),
        };

        loop {
            let ready = self.ready_steps(&current_plan, &execution);
            if ready.is_empty() {
                let stuck = execution
                    .steps
                    .values()
                    .filter(|s| !s.status.is_terminal())
                    .count();
                if stuck > 0 {
                    let _ = self
                        .audit_log
                        .log(
                            client_id,
                            AuditEventKind::ExecutionFailed,
                            json!({"plan_id": current_plan.id, "detail": "no ready steps with non-terminal steps remaining"}),
                            Some(current_plan.id.clone()),
                            None,
                        )
                        .await;
                    return Err(OrchestratorError::PlanStructure {
                        detail: format!(
                            "{stuck} step(s) stuck pending on a dependency that will never complete"
                        ),
                    });
                }
                break;
            }

            let (parallel, sequential): (Vec<_>, Vec<_>) =
                ready.into_iter().partition(|s| s.parallelizable);

            let parallel_outcomes = futures::future::join_all(parallel.iter().map(|step| {
                self.run_step(client_id, step, &execution.results, conversation_history, &cancel)
            }))
            .await;
            for (step, outcome) in parallel.iter().zip(parallel_outcomes) {
                self.apply_outcome(&mut execution, step, outcome);
            }

            for step in &sequential {
                let outcome = self
                    .run_step(client_id, step, &execution.results, conversation_history, &cancel)
                    .await;
                self.apply_outcome(&mut execution, step, outcome);
            }

            let total = execution.steps.len().max(1);
            let completed = execution
                .steps
                .values()
                .filter(|s| s.status.is_terminal())
                .count();
            self.publish_progress(&current_plan.id, (completed * 100 / total) as u32)
                .await;

            if cancel.is_cancelled() {
                self.cancel_remaining(&mut execution);
                execution.status = PlanStatus::Cancelled;
                break;
            }

            match self.drain_revisions(&mut context_updates, &current_plan, &execution).await {
                RevisionOutcome::Cancel => {
                    self.cancel_remaining(&mut execution);
                    execution.status = PlanStatus::Cancelled;
                    break;
                }
                RevisionOutcome::Continue(_) => {}
                RevisionOutcome::Revised(new_plan) => {
                    let completed_ids: HashSet<String> = execution
                        .steps
                        .iter()
                        .filter(|(_, s)| s.status == StepStatus::Completed)
                        .map(|(id, _)| id.clone())
                        .collect();
                    current_plan = merge_residual_plan(&current_plan, &new_plan, &completed_ids);
                    for step in &current_plan.steps {
                        execution
                            .steps
                            .entry(step.id.clone())
                            .or_insert_with(|| StepExecution::pending(step.id.clone()));
                    }
                }
            }
        }

        if execution.status == PlanStatus::Running {
            execution.recompute_status();
        }
        execution.ended_at = Some(Utc::now());

        let response_text = self.synthesize(&current_plan, &execution).await;

        let audit_kind = match execution.status {
            PlanStatus::Completed => AuditEventKind::ExecutionCompleted,
            _ => AuditEventKind::ExecutionFailed,
        };
        let _ = self
            .audit_log
            .log(
                client_id,
                audit_kind,
                json!({"plan_id": current_plan.id, "status": format!("{:?}", execution.status)}),
                Some(current_plan.id.clone()),
                None,
            )
            .await;

        Ok((execution, response_text))
    }

    fn ready_steps(&self, plan: &ExecutionPlan, execution: &PlanExecution) -> Vec<ExecutionStep> {
        plan.steps
            .iter()
            .filter(|step| {
                let Some(record) = execution.steps.get(&step.id) else {
                    return false;
                };
                if record.status != StepStatus::Pending {
                    return false;
                }
                step.dependencies.iter().all(|dep| {
                    execution
                        .steps
                        .get(dep)
                        .map(|d| d.status == StepStatus::Completed)
                        .unwrap_or(true)
                })
            })
            .cloned()
            .collect()
    }

    fn apply_outcome(&self, execution: &mut PlanExecution, step: &ExecutionStep, outcome: StepExecution) {
        if outcome.status == StepStatus::Completed {
            if let Some(result) = outcome.result.clone() {
                execution.results.insert(step.id.clone(), result);
            }
        }
        execution.progress_log.push(format!(
            "{} -> {:?}",
            step.id,
            outcome.status
        ));
        execution.steps.insert(step.id.clone(), outcome);
    }

    fn cancel_remaining(&self, execution: &mut PlanExecution) {
        let now = Utc::now();
        for record in execution.steps.values_mut() {
            if !record.status.is_terminal() {
                record.transition(StepStatus::Cancelled, now);
            }
        }
    }

    async fn drain_revisions(
        &self,
        context_updates: &mut mpsc::UnboundedReceiver<String>,
        plan: &ExecutionPlan,
        execution: &PlanExecution,
    ) -> RevisionOutcome {
        let completed_ids: HashSet<String> = execution
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect();
        while let Ok(message) = context_updates.try_recv() {
            match self.reviser.revise(plan, &message, &completed_ids).await {
                RevisionOutcome::Continue(_) => continue,
                other => return other,
            }
        }
        RevisionOutcome::Continue(plan.clone())
    }

    async fn run_step(
        &self,
        client_id: &str,
        step: &ExecutionStep,
        previous_results: &HashMap<String, Value>,
        conversation_history: &[String],
        cancel: &CancellationToken,
    ) -> StepExecution {
        let mut record = StepExecution::pending(step.id.clone());
        let now = Utc::now();

        if step.requires_permission {
            record.transition(StepStatus::AwaitingPermission, now);
            let response = self
                .permission_gate
                .request(
                    client_id,
                    &step.id,
                    &step.tool_name,
                    &step.description,
                    step.parameters.clone(),
                    PermissionLevel::RequireConfirmation,
                    cancel,
                )
                .await
                .unwrap_or_else(|_| aegis_types::PermissionResponse {
                    approved: false,
                    reason: Some("permission gate unavailable".to_string()),
                });
            let audit_kind = if response.approved {
                AuditEventKind::PermissionGranted
            } else {
                AuditEventKind::PermissionDenied
            };
            let _ = self
                .audit_log
                .log(
                    client_id,
                    audit_kind,
                    json!({"step_id": step.id, "tool": step.tool_name}),
                    None,
                    None,
                )
                .await;
            if !response.approved {
                record.transition(
                    StepStatus::Failed,
                    Utc::now(),
                );
                record.error = Some(
                    response
                        .reason
                        .unwrap_or_else(|| "permission denied".to_string()),
                );
                return record;
            }
            record.transition(StepStatus::Running, Utc::now());
        } else {
            record.transition(StepStatus::Running, Utc::now());
        }

        let ctx = ExecutionContext {
            client_id: client_id.to_string(),
            conversation_history: conversation_history.to_vec(),
            previous_step_results: previous_results.clone(),
        };

        loop {
            let timeout_ms = step.estimated_duration_ms.unwrap_or(self.step_timeout_ms);
            let child_cancel = cancel.child_token();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => Err("cancelled".to_string()),
                result = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    self.plugin_registry.execute(&step.tool_name, step.parameters.clone(), &ctx, child_cancel),
                ) => match result {
                    Ok(Ok(tool_result)) if tool_result.success => Ok(tool_result.data),
                    Ok(Ok(tool_result)) => Err(tool_result.error.unwrap_or_else(|| "tool reported failure".to_string())),
                    Ok(Err(unavailable)) => Err(unavailable.to_string()),
                    Err(_) => Err(format!("step timed out after {timeout_ms}ms")),
                },
            };

            let _ = self
                .audit_log
                .log(
                    client_id,
                    AuditEventKind::ToolExecuted,
                    json!({"step_id": step.id, "tool": step.tool_name, "ok": attempt.is_ok()}),
                    None,
                    None,
                )
                .await;

            match attempt {
                Ok(data) => {
                    record.result = Some(data);
                    record.transition(StepStatus::Completed, Utc::now());
                    return record;
                }
                Err(detail) => {
                    if cancel.is_cancelled() {
                        record.transition(StepStatus::Cancelled, Utc::now());
                        record.error = Some(detail);
                        return record;
                    }
                    if record.retry_count < self.max_retries {
                        record.transition(StepStatus::Running, Utc::now());
                        let backoff_ms = 1000u64 * 2u64.pow(record.retry_count);
                        tracing::info!(
                            step = step.id.as_str(),
                            tool = step.tool_name.as_str(),
                            retry = record.retry_count,
                            "step failed, retrying in {}ms: {}", backoff_ms, detail
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    }
                    tracing::warn!(
                        step = step.id.as_str(),
                        tool = step.tool_name.as_str(),
                        "step exhausted retries: {}", detail
                    );
                    record.error = Some(detail);
                    record.transition(StepStatus::Failed, Utc::now());
                    return record;
                }
            }
        }
    }

    async fn synthesize(&self, plan: &ExecutionPlan, execution: &PlanExecution) -> String {
        let successes: Vec<(String, Value)> = plan
            .steps
            .iter()
            .filter_map(|step| {
                execution
                    .results
                    .get(&step.id)
                    .map(|v| (step.tool_name.clone(), v.clone()))
            })
            .collect();
        let failures: Vec<(String, String)> = execution
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Failed)
            .filter_map(|(id, s)| {
                plan.steps
                    .iter()
                    .find(|step| &step.id == id)
                    .map(|step| (step.tool_name.clone(), s.error.clone().unwrap_or_default()))
            })
            .collect();

        let oracle = match self.oracle_registry.get(None).await {
            Ok(oracle) => oracle,
            Err(_) => return fallback_synthesis(&successes, &failures),
        };
        oracle
            .synthesize(&plan.query, &successes, &failures)
            .await
            .unwrap_or_else(|_| fallback_synthesis(&successes, &failures))
    }

    async fn publish_progress(&self, plan_id: &str, percent: u32) {
        let _ = self
            .event_bus
            .publish(Event::new(
                "ProgressUpdate",
                EventPriority::Low,
                "executor",
                json!({"plan_id": plan_id, "percent": percent, "id": Uuid::new_v4().to_string()}),
            ))
            .await;
    }
}

fn fallback_synthesis(successes: &[(String, Value)], failures: &[(String, String)]) -> String {
    if successes.is_empty() {
        return format!(
            "no steps completed successfully ({} failed)",
            failures.len()
        );
    }
    successes
        .iter()
        .map(|(tool, value)| format!("{tool}: {value}"))
        .collect::<Vec<_>>()
        .join(". ")
}

fn merge_residual_plan(
    current: &ExecutionPlan,
    residual: &ExecutionPlan,
    completed_ids: &HashSet<String>,
) -> ExecutionPlan {
    let mut steps: Vec<ExecutionStep> = current
        .steps
        .iter()
        .filter(|s| completed_ids.contains(&s.id))
        .cloned()
        .collect();
    for step in &residual.steps {
        if !completed_ids.contains(&step.id) {
            steps.push(step.clone());
        }
    }
    ExecutionPlan {
        id: current.id.clone(),
        query: residual.query.clone(),
        steps,
        requires_user_permission: residual.requires_user_permission,
        created_at: current.created_at,
        estimated_total_duration_ms: residual.estimated_total_duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_oracle::ScriptedOracle;
    use aegis_tools::{ToolPlugin, ToolResult};
    use aegis_types::{Tool, ToolCapability, ToolParameter};
    use async_trait::async_trait;
    use std::collections::HashSet as StdHashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysSucceeds;

    #[async_trait]
    impl ToolPlugin for AlwaysSucceeds {
        fn descriptor(&self) -> Tool {
            Tool {
                name: "succeed".to_string(),
                category: "utility".to_string(),
                description: "always succeeds".to_string(),
                parameters: vec![],
                capabilities: StdHashSet::from([ToolCapability::ReadOnly]),
            }
        }
        async fn execute(&self, _params: HashMap<String, Value>, _ctx: &ExecutionContext) -> ToolResult {
            ToolResult::ok(json!({"answer": "done"}))
        }
    }

    struct FailsTwiceThenSucceeds {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ToolPlugin for FailsTwiceThenSucceeds {
        fn descriptor(&self) -> Tool {
            Tool {
                name: "flaky".to_string(),
                category: "utility".to_string(),
                description: "fails twice then succeeds".to_string(),
                parameters: vec![],
                capabilities: StdHashSet::from([ToolCapability::ReadOnly]),
            }
        }
        async fn execute(&self, _params: HashMap<String, Value>, _ctx: &ExecutionContext) -> ToolResult {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                ToolResult::err("transient failure")
            } else {
                ToolResult::ok(json!({"answer": "recovered"}))
            }
        }
    }

    struct FailsAlways;

    #[async_trait]
    impl ToolPlugin for FailsAlways {
        fn descriptor(&self) -> Tool {
            Tool {
                name: "broken".to_string(),
                category: "utility".to_string(),
                description: "always fails".to_string(),
                parameters: vec![],
                capabilities: StdHashSet::from([ToolCapability::ReadOnly]),
            }
        }
        async fn execute(&self, _params: HashMap<String, Value>, _ctx: &ExecutionContext) -> ToolResult {
            ToolResult::err("permanent failure")
        }
    }

    struct StateChangingTool;

    #[async_trait]
    impl ToolPlugin for StateChangingTool {
        fn descriptor(&self) -> Tool {
            Tool {
                name: "mutate".to_string(),
                category: "system".to_string(),
                description: "changes state".to_string(),
                parameters: vec![ToolParameter {
                    name: "value".to_string(),
                    param_type: "string".to_string(),
                    description: String::new(),
                    required: false,
                }],
                capabilities: StdHashSet::from([ToolCapability::StateChanging]),
            }
        }
        async fn execute(&self, _params: HashMap<String, Value>, _ctx: &ExecutionContext) -> ToolResult {
            ToolResult::ok(Value::Null)
        }
    }

    fn single_step_plan(tool_name: &str, requires_permission: bool) -> ExecutionPlan {
        ExecutionPlan {
            id: Uuid::new_v4().to_string(),
            query: "do it".to_string(),
            steps: vec![ExecutionStep {
                id: "step_1".to_string(),
                tool_name: tool_name.to_string(),
                description: "invoke".to_string(),
                parameters: HashMap::new(),
                dependencies: HashSet::new(),
                requires_permission,
                parallelizable: true,
                estimated_duration_ms: None,
            }],
            requires_user_permission: requires_permission,
            created_at: Utc::now(),
            estimated_total_duration_ms: 1000,
        }
    }

    async fn executor_with(plugins: Vec<Arc<dyn ToolPlugin>>, max_retries: u32) -> Executor {
        let oracle_registry = Arc::new(OracleRegistry::new());
        oracle_registry
            .register(Arc::new(ScriptedOracle::new("scripted")), true)
            .await;
        let plugin_registry = Arc::new(PluginRegistry::new());
        for plugin in plugins {
            plugin_registry.register(plugin).await;
        }
        let event_bus = EventBus::new();
        let audit_log = Arc::new(AuditLog::open_in_memory(30).unwrap());
        let permission_gate = Arc::new(PermissionGate::new(event_bus.clone(), 100));
        let reviser = Arc::new(crate::planner::Planner::new(
            oracle_registry.clone(),
            plugin_registry.clone(),
        ));
        Executor::new(
            event_bus,
            audit_log,
            permission_gate,
            plugin_registry,
            oracle_registry,
            reviser,
            max_retries,
        )
    }

    #[tokio::test]
    async fn single_step_plan_completes_and_synthesizes() {
        let executor = executor_with(vec![Arc::new(AlwaysSucceeds)], 1).await;
        let plan = single_step_plan("succeed", false);
        let (_tx, rx) = mpsc::unbounded_channel();
        let (execution, response) = executor
            .execute("client-a", plan, &[], rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, PlanStatus::Completed);
        assert!(response.contains("done"));
    }

    #[tokio::test]
    async fn retries_transient_failure_until_success() {
        let executor = executor_with(
            vec![Arc::new(FailsTwiceThenSucceeds {
                attempts: AtomicU32::new(0),
            })],
            3,
        )
        .await;
        let plan = single_step_plan("flaky", false);
        let (_tx, rx) = mpsc::unbounded_channel();
        let (execution, _) = executor
            .execute("client-a", plan, &[], rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn permission_timeout_fails_the_step() {
        let executor = executor_with(vec![Arc::new(StateChangingTool)], 0).await;
        let plan = single_step_plan("mutate", true);
        let (_tx, rx) = mpsc::unbounded_channel();
        let (execution, _) = executor
            .execute("client-a", plan, &[], rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, PlanStatus::Failed);
    }

    #[tokio::test]
    async fn dependent_of_a_permanently_failed_step_fails_the_plan() {
        let executor = executor_with(vec![Arc::new(FailsAlways), Arc::new(AlwaysSucceeds)], 0).await;
        let plan = ExecutionPlan {
            id: Uuid::new_v4().to_string(),
            query: "do it".to_string(),
            steps: vec![
                ExecutionStep {
                    id: "step_1".to_string(),
                    tool_name: "broken".to_string(),
                    description: "invoke".to_string(),
                    parameters: HashMap::new(),
                    dependencies: HashSet::new(),
                    requires_permission: false,
                    parallelizable: true,
                    estimated_duration_ms: None,
                },
                ExecutionStep {
                    id: "step_2".to_string(),
                    tool_name: "succeed".to_string(),
                    description: "invoke after step_1".to_string(),
                    parameters: HashMap::new(),
                    dependencies: HashSet::from(["step_1".to_string()]),
                    requires_permission: false,
                    parallelizable: true,
                    estimated_duration_ms: None,
                },
            ],
            requires_user_permission: false,
            created_at: Utc::now(),
            estimated_total_duration_ms: 2000,
        };
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = executor
            .execute("client-a", plan, &[], rx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(OrchestratorError::PlanStructure { .. })));
    }

    #[test]
    fn merge_residual_plan_keeps_completed_steps_untouched() {
        let current = single_step_plan("succeed", false);
        let mut completed = HashSet::new();
        completed.insert("step_1".to_string());
        let residual = ExecutionPlan {
            id: current.id.clone(),
            query: "follow up".to_string(),
            steps: vec![ExecutionStep {
                id: "step_2".to_string(),
                tool_name: "succeed".to_string(),
                description: "invoke".to_string(),
                parameters: HashMap::new(),
                dependencies: HashSet::new(),
                requires_permission: false,
                parallelizable: true,
                estimated_duration_ms: None,
            }],
            requires_user_permission: false,
            created_at: current.created_at,
            estimated_total_duration_ms: 1000,
        };
        let merged = merge_residual_plan(&current, &residual, &completed);
        assert_eq!(merged.steps.len(), 2);
        assert!(merged.steps.iter().any(|s| s.id == "step_1"));
        assert!(merged.steps.iter().any(|s| s.id == "step_2"));
    }
}
