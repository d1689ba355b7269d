use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A named capability exposed by a plugin. Names are globally unique and
/// immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    ReadOnly,
    StateChanging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub category: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub capabilities: HashSet<ToolCapability>,
}

impl Tool {
    pub fn is_read_only(&self) -> bool {
        self.capabilities.contains(&ToolCapability::ReadOnly)
            && !self.capabilities.contains(&ToolCapability::StateChanging)
    }
}

/// One DAG node: a single tool invocation inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub tool_name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    #[serde(default)]
    pub requires_permission: bool,
    #[serde(default = "default_true")]
    pub parallelizable: bool,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Ordered bag of steps produced by the Planner. Never mutated after
/// creation; a revision always yields a new plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub query: String,
    pub steps: Vec<ExecutionStep>,
    pub requires_user_permission: bool,
    pub created_at: DateTime<Utc>,
    pub estimated_total_duration_ms: u64,
}

impl ExecutionPlan {
    /// Detects a cycle in the step dependency relation using Kahn's algorithm.
    pub fn is_acyclic(&self) -> bool {
        let mut indegree: HashMap<&str, usize> =
            self.steps.iter().map(|s| (s.id.as_str(), 0)).collect();
        for step in &self.steps {
            for dep in &step.dependencies {
                if let Some(count) = indegree.get_mut(step.id.as_str()) {
                    if self.steps.iter().any(|s| &s.id == dep) {
                        *count += 1;
                    }
                }
            }
        }
        let mut queue: Vec<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            for step in &self.steps {
                if step.dependencies.contains(id) {
                    if let Some(count) = indegree.get_mut(step.id.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push(step.id.as_str());
                        }
                    }
                }
            }
        }
        visited == self.steps.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    AwaitingPermission,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

/// Runtime record for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StepExecution {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            retry_count: 0,
            result: None,
            error: None,
        }
    }

    /// Enforces the allowed status transition graph. Returns false (and does
    /// not mutate) on an illegal transition.
    pub fn transition(&mut self, next: StepStatus, now: DateTime<Utc>) -> bool {
        let allowed = match (self.status, next) {
            (StepStatus::Pending, StepStatus::AwaitingPermission) => true,
            (StepStatus::Pending, StepStatus::Running) => true,
            (StepStatus::AwaitingPermission, StepStatus::Running) => true,
            (StepStatus::AwaitingPermission, StepStatus::Failed) => true,
            (StepStatus::Running, StepStatus::Running) => true, // retry
            (StepStatus::Running, StepStatus::Completed) => true,
            (StepStatus::Running, StepStatus::Failed) => true,
            (StepStatus::Running, StepStatus::Cancelled) => true,
            (StepStatus::Pending, StepStatus::Cancelled) => true,
            (StepStatus::AwaitingPermission, StepStatus::Cancelled) => true,
            _ => false,
        };
        if !allowed {
            return false;
        }
        if next == StepStatus::Running && self.status == StepStatus::Running {
            self.retry_count += 1;
        }
        if self.started_at.is_none() && next == StepStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = next;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Runtime record for one plan execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    pub plan_id: String,
    pub client_id: String,
    pub status: PlanStatus,
    pub steps: HashMap<String, StepExecution>,
    pub results: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub progress_log: Vec<String>,
}

impl PlanExecution {
    /// Computes overall status per the §3 invariant: Completed iff at least
    /// one step completed, Failed iff all steps failed, else the caller must
    /// have set Cancelled externally.
    pub fn recompute_status(&mut self) {
        let completed = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let failed = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        if completed > 0 {
            self.status = PlanStatus::Completed;
        } else if failed == self.steps.len() && !self.steps.is_empty() {
            self.status = PlanStatus::Failed;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextUpdateImpact {
    PlanModified,
    NoChange,
    TaskCancelled,
}

/// A user message addressed to an in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub id: String,
    pub task_id: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub impact: Option<ContextUpdateImpact>,
}

impl ContextUpdate {
    pub fn new(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            message: message.into(),
            received_at: Utc::now(),
            processed: false,
            impact: None,
        }
    }
}

/// The unit of per-client concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTask {
    pub id: String,
    pub client_id: String,
    pub query: String,
    pub state: TaskState,
    pub plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub context_updates: Vec<ContextUpdate>,
}

impl ActiveTask {
    pub fn new(client_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            query: query.into(),
            state: TaskState::Pending,
            plan_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            context_updates: Vec::new(),
        }
    }

    pub fn set_state(&mut self, state: TaskState, now: DateTime<Utc>) {
        if state == TaskState::Active && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if state.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.state = state;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    AutoApprove,
    RequireConfirmation,
    AdminOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub client_id: String,
    pub step_id: String,
    pub tool: String,
    pub description: String,
    pub parameters: HashMap<String, Value>,
    pub level: PermissionLevel,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub approved: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    QueryReceived,
    PlanCreated,
    ToolExecuted,
    PermissionRequested,
    PermissionGranted,
    PermissionDenied,
    ContextShared,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    PluginRegistered,
    PluginFailed,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventKind::QueryReceived => "query_received",
            AuditEventKind::PlanCreated => "plan_created",
            AuditEventKind::ToolExecuted => "tool_executed",
            AuditEventKind::PermissionRequested => "permission_requested",
            AuditEventKind::PermissionGranted => "permission_granted",
            AuditEventKind::PermissionDenied => "permission_denied",
            AuditEventKind::ContextShared => "context_shared",
            AuditEventKind::ExecutionStarted => "execution_started",
            AuditEventKind::ExecutionCompleted => "execution_completed",
            AuditEventKind::ExecutionFailed => "execution_failed",
            AuditEventKind::PluginRegistered => "plugin_registered",
            AuditEventKind::PluginFailed => "plugin_failed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "query_received" => AuditEventKind::QueryReceived,
            "plan_created" => AuditEventKind::PlanCreated,
            "tool_executed" => AuditEventKind::ToolExecuted,
            "permission_requested" => AuditEventKind::PermissionRequested,
            "permission_granted" => AuditEventKind::PermissionGranted,
            "permission_denied" => AuditEventKind::PermissionDenied,
            "context_shared" => AuditEventKind::ContextShared,
            "execution_started" => AuditEventKind::ExecutionStarted,
            "execution_completed" => AuditEventKind::ExecutionCompleted,
            "execution_failed" => AuditEventKind::ExecutionFailed,
            "plugin_registered" => AuditEventKind::PluginRegistered,
            "plugin_failed" => AuditEventKind::PluginFailed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub user_id: Option<String>,
    pub event_type: AuditEventKind,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Skip,
    Restart,
    Degrade,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: ComponentStatus,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub degraded_mode: bool,
    pub error_ring: Vec<String>,
    pub active_recovery: Option<RecoveryStrategy>,
}

impl ComponentHealth {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: ComponentStatus::Healthy,
            consecutive_failures: 0,
            last_check: None,
            last_success: None,
            degraded_mode: false,
            error_ring: Vec::new(),
            active_recovery: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub priority: EventPriority,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        priority: EventPriority,
        source: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            priority,
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
