//! Top-level façade: `handle_message` is the single entry point a transport
//! (CLI, future server) calls per inbound message.

use std::collections::HashMap;
use std::sync::Arc;

use aegis_core::{AuditLog, EventBus, PermissionGate};
use aegis_oracle::OracleRegistry;
use aegis_tools::{ExecutionContext, PluginRegistry};
use aegis_types::{
    AuditEventKind, Event, EventPriority, OrchestratorError, PermissionLevel, PermissionResponse,
    TaskState,
};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::executor::Executor;
use crate::planner::Planner;
use crate::recovery::{HealthMonitor, HealthProbe, RecoveryManager};
use crate::routing::RoutingClassifier;
use crate::task_manager::TaskManager;

/// Reaches the default configured oracle with a trivial classify call.
/// Registered with `DiagnosticsTier::OracleReachability`, per the decision
/// to keep the superset of both known diagnostics test sets and mark the
/// oracle probes as part of the standard tier rather than excluding them.
struct OracleReachabilityProbe {
    oracle_registry: Arc<OracleRegistry>,
}

#[async_trait::async_trait]
impl HealthProbe for OracleReachabilityProbe {
    async fn check(&self) -> Result<(), String> {
        let oracle = self
            .oracle_registry
            .get(None)
            .await
            .map_err(|e| e.to_string())?;
        oracle
            .classify("ping", &[])
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

const SIMPLE_QUERY_MAX_WORDS: usize = 8;
const TRUNCATED_ID_LEN: usize = 8;

pub struct Orchestrator {
    event_bus: EventBus,
    audit_log: Arc<AuditLog>,
    permission_gate: Arc<PermissionGate>,
    plugin_registry: Arc<PluginRegistry>,
    oracle_registry: Arc<OracleRegistry>,
    routing: Arc<RoutingClassifier>,
    planner: Arc<Planner>,
    executor: Arc<Executor>,
    task_manager: Arc<TaskManager>,
    recovery: Arc<RecoveryManager>,
    health_monitor: Arc<HealthMonitor>,
    health_monitor_cancel: CancellationToken,
    running_context_senders: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<String>>>>,
    running_cancellations: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_bus: EventBus,
        audit_log: Arc<AuditLog>,
        permission_gate: Arc<PermissionGate>,
        plugin_registry: Arc<PluginRegistry>,
        oracle_registry: Arc<OracleRegistry>,
        routing: Arc<RoutingClassifier>,
        planner: Arc<Planner>,
        executor: Arc<Executor>,
        task_manager: Arc<TaskManager>,
        recovery: Arc<RecoveryManager>,
        health_check_interval_ms: u64,
    ) -> Self {
        let health_monitor = Arc::new(HealthMonitor::new(recovery.clone(), health_check_interval_ms));
        let health_monitor_cancel = CancellationToken::new();
        {
            let monitor = health_monitor.clone();
            let probe_registry = oracle_registry.clone();
            let cancel = health_monitor_cancel.clone();
            tokio::spawn(async move {
                monitor
                    .register_probe(
                        "oracle",
                        Arc::new(OracleReachabilityProbe {
                            oracle_registry: probe_registry,
                        }),
                        false,
                        aegis_observability::DiagnosticsTier::OracleReachability,
                    )
                    .await;
                monitor.run_loop(cancel).await;
            });
        }
        Self {
            event_bus,
            audit_log,
            permission_gate,
            plugin_registry,
            oracle_registry,
            routing,
            planner,
            executor,
            task_manager,
            recovery,
            health_monitor,
            health_monitor_cancel,
            running_context_senders: Arc::new(RwLock::new(HashMap::new())),
            running_cancellations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The six-branch decision order: meta-query, context-update routing,
    /// fast-path, simple-query streaming, and full planned execution.
    pub async fn handle_message(&self, client_id: &str, message: &str) -> Result<String, OrchestratorError> {
        self.audit_log
            .log(
                client_id,
                AuditEventKind::QueryReceived,
                json!({"message": message}),
                None,
                None,
            )
            .await?;

        if let Some(answer) = self.meta_query_answer(message).await {
            return Ok(answer);
        }

        if let Some(task) = self.task_manager.find_related_task(client_id, message).await {
            self.task_manager.add_context_update(&task.id, message).await;
            if let Some(sender) = self.running_context_senders.read().await.get(&task.id) {
                let _ = sender.send(message.to_string());
            }
            return Ok(format!("Updating task {} with your new message.", short_id(&task.id)));
        }

        let decision = self
            .routing
            .classify(message)
            .await
            .map_err(|e| OrchestratorError::Oracle { detail: e.to_string() })?;

        if self.routing.should_route_directly(&decision) {
            return self.execute_fast_path(client_id, message, &decision.tool_name).await;
        }

        if is_simple_query(message) {
            return self.stream_simple_response(client_id, message).await;
        }

        self.execute_planned(client_id, message).await
    }

    async fn meta_query_answer(&self, message: &str) -> Option<String> {
        let lower = message.to_lowercase();
        if lower.contains("what tools") || lower.contains("what can you do") {
            let catalog = self.plugin_registry.catalog().await;
            let names: Vec<String> = catalog.into_iter().map(|t| t.name).collect();
            return Some(format!("Available tools: {}", names.join(", ")));
        }
        None
    }

    /// Bypasses the DAG executor entirely: a single direct tool call, no
    /// synthesis, no retries, no progress events. Per decision branch 4, the
    /// returned text is the tool's own rendered output.
    async fn execute_fast_path(
        &self,
        client_id: &str,
        message: &str,
        tool_name: &str,
    ) -> Result<String, OrchestratorError> {
        let description = format!("invoke {tool_name}");
        let requires_permission = !self
            .plugin_registry
            .is_read_only(tool_name)
            .await
            .unwrap_or(false);

        self.audit_log
            .log(
                client_id,
                AuditEventKind::PlanCreated,
                json!({"steps": 1, "fastPath": true}),
                None,
                None,
            )
            .await?;

        let cancel = CancellationToken::new();
        if requires_permission {
            let response = self
                .permission_gate
                .request(
                    client_id,
                    "step_1",
                    tool_name,
                    &description,
                    HashMap::new(),
                    PermissionLevel::RequireConfirmation,
                    &cancel,
                )
                .await?;
            if !response.approved {
                return Err(OrchestratorError::PermissionDenied {
                    step_description: description,
                    reason: response.reason.unwrap_or_else(|| "permission denied".to_string()),
                });
            }
        }

        let ctx = ExecutionContext {
            client_id: client_id.to_string(),
            conversation_history: vec![message.to_string()],
            previous_step_results: HashMap::new(),
        };
        let tool_result = self
            .plugin_registry
            .execute(tool_name, HashMap::new(), &ctx, cancel)
            .await
            .map_err(|e| OrchestratorError::ToolUnavailable { tool: e.0 })?;

        if !tool_result.success {
            return Err(OrchestratorError::ToolExecution {
                tool: tool_name.to_string(),
                step_description: description,
                detail: tool_result
                    .error
                    .unwrap_or_else(|| "tool reported failure".to_string()),
            });
        }

        let response_text = aegis_oracle::render_result(&tool_result.data);

        let _ = self
            .event_bus
            .publish(Event::new(
                "ResponseGenerated",
                EventPriority::Medium,
                "orchestrator",
                json!({"client_id": client_id, "subsystem": tool_name, "text": response_text}),
            ))
            .await;

        Ok(response_text)
    }

    /// Buffers oracle stream fragments into sentence-terminated chunks (a
    /// `.`/`!`/`?` followed by whitespace), publishing each as an `Urgent`
    /// `ResponseChunk`. The final, possibly sentence-less, tail is published
    /// with `is_complete: true`. No terminal `ResponseGenerated` for this
    /// path: the chunk stream itself is the complete response.
    async fn stream_simple_response(&self, client_id: &str, message: &str) -> Result<String, OrchestratorError> {
        let oracle = self
            .oracle_registry
            .get(None)
            .await
            .map_err(|e| OrchestratorError::Oracle { detail: e.to_string() })?;
        let mut stream = oracle.stream(message, &[]).await;
        let mut full_text = String::new();
        let mut buffer = String::new();
        while let Some(fragment) = stream.next().await {
            full_text.push_str(&fragment);
            buffer.push_str(&fragment);
            while let Some(boundary) = sentence_boundary(&buffer) {
                let sentence: String = buffer.drain(..boundary).collect();
                self.publish_response_chunk(client_id, &sentence, false).await;
            }
        }
        if !buffer.is_empty() {
            self.publish_response_chunk(client_id, &buffer, true).await;
        }
        Ok(full_text)
    }

    async fn publish_response_chunk(&self, client_id: &str, chunk: &str, is_complete: bool) {
        let _ = self
            .event_bus
            .publish(Event::new(
                "ResponseChunk",
                EventPriority::Urgent,
                "orchestrator",
                json!({"client_id": client_id, "chunk": chunk, "is_complete": is_complete}),
            ))
            .await;
    }

    async fn execute_planned(&self, client_id: &str, message: &str) -> Result<String, OrchestratorError> {
        let task = self.task_manager.create(client_id, message).await?;
        self.task_manager.update_state(&task.id, TaskState::Active).await;

        let plan = self.planner.plan(message, &[]).await?;
        self.audit_log
            .log(
                client_id,
                AuditEventKind::PlanCreated,
                json!({"steps": plan.steps.len(), "fastPath": false}),
                None,
                None,
            )
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.running_context_senders
            .write()
            .await
            .insert(task.id.clone(), tx);
        self.running_cancellations
            .write()
            .await
            .insert(task.id.clone(), cancel.clone());

        let executor = self.executor.clone();
        let event_bus = self.event_bus.clone();
        let task_manager = self.task_manager.clone();
        let senders = self.running_context_senders.clone();
        let cancellations = self.running_cancellations.clone();
        let client_id_owned = client_id.to_string();
        let task_id = task.id.clone();

        tokio::spawn(async move {
            let result = executor
                .execute(&client_id_owned, plan, &[], rx, cancel)
                .await;
            senders.write().await.remove(&task_id);
            cancellations.write().await.remove(&task_id);

            match result {
                Ok((_execution, response_text)) => {
                    task_manager.complete(&task_id, json!(response_text.clone())).await;
                    let _ = event_bus
                        .publish(Event::new(
                            "ResponseGenerated",
                            EventPriority::Medium,
                            "orchestrator",
                            json!({"client_id": client_id_owned, "task_id": task_id, "text": response_text}),
                        ))
                        .await;
                    let _ = event_bus
                        .publish(Event::new(
                            "TaskCompleted",
                            EventPriority::Medium,
                            "orchestrator",
                            json!({"client_id": client_id_owned, "task_id": task_id}),
                        ))
                        .await;
                }
                Err(_) => {
                    task_manager.cancel(&task_id).await;
                }
            }
        });

        Ok(format!(
            "Working on it (task {}). I'll follow up shortly.",
            short_id(&task.id)
        ))
    }

    pub async fn cancel_task(&self, task_id: &str) {
        if let Some(cancel) = self.running_cancellations.read().await.get(task_id) {
            cancel.cancel();
        }
        self.task_manager.cancel(task_id).await;
    }

    pub async fn respond_to_permission(&self, request_id: &str, approved: bool, reason: Option<String>) {
        self.permission_gate.respond(request_id, approved, reason).await;
    }

    pub async fn respond_permission_denied(&self, request_id: &str) -> PermissionResponse {
        self.permission_gate.respond(request_id, false, Some("declined by user".to_string())).await;
        PermissionResponse {
            approved: false,
            reason: Some("declined by user".to_string()),
        }
    }

    pub async fn active_tasks(&self, client_id: &str) -> Vec<aegis_types::ActiveTask> {
        self.task_manager.list_for_client(client_id).await
    }

    pub async fn overall_health(&self) -> aegis_types::ComponentStatus {
        self.recovery.overall_health().await
    }

    /// Per-component health paired with the tier of the probe that feeds
    /// it, including the oracle-reachability probe as the standard tier.
    pub async fn diagnostics(&self) -> Vec<(aegis_types::ComponentHealth, Option<aegis_observability::DiagnosticsTier>)> {
        self.health_monitor.diagnostics().await
    }

    /// Stops timers, flushes the audit log, and closes the event bus. No
    /// further messages should be handled after this returns.
    pub async fn shutdown(&self) {
        self.health_monitor_cancel.cancel();
        let cancellations = self.running_cancellations.read().await;
        for cancel in cancellations.values() {
            cancel.cancel();
        }
        drop(cancellations);
        let _ = self.audit_log.cleanup().await;
        self.event_bus.shutdown().await;
    }
}

/// Byte offset just past the first `.`/`!`/`?` in `buffer` that is followed
/// by whitespace, if any. `None` means `buffer` holds no complete sentence
/// yet.
fn sentence_boundary(buffer: &str) -> Option<usize> {
    let bytes = buffer.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            match bytes.get(i + 1) {
                Some(next) if next.is_ascii_whitespace() => return Some(i + 2),
                None => return None,
                _ => continue,
            }
        }
    }
    None
}

fn is_simple_query(message: &str) -> bool {
    let word_count = message.split_whitespace().count();
    let multi_step_markers = ["then", "after that", "and then", "next,"];
    let lower = message.to_lowercase();
    word_count <= SIMPLE_QUERY_MAX_WORDS && !multi_step_markers.iter().any(|m| lower.contains(m))
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(TRUNCATED_ID_LEN)]
}
