use thiserror::Error;

/// Error taxonomy for the orchestration core. Variants carry enough structured
/// context (step description, tool name, component) that a presentation layer
/// can report a failure without leaking internal identifiers.
#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    #[error("tool '{tool}' is not registered")]
    ToolUnavailable { tool: String },

    #[error("permission denied for step '{step_description}': {reason}")]
    PermissionDenied {
        step_description: String,
        reason: String,
    },

    #[error("step '{step_description}' timed out after {timeout_ms}ms")]
    StepTimeout {
        step_description: String,
        timeout_ms: u64,
    },

    #[error("tool '{tool}' failed while executing step '{step_description}': {detail}")]
    ToolExecution {
        tool: String,
        step_description: String,
        detail: String,
    },

    #[error("could not parse plan returned by the language oracle: {detail}")]
    PlanParse { detail: String },

    #[error("plan is structurally invalid: {detail}")]
    PlanStructure { detail: String },

    #[error("language oracle call failed: {detail}")]
    Oracle { detail: String },

    #[error("client '{client_id}' has reached the concurrent task limit ({limit})")]
    TooManyTasks { client_id: String, limit: usize },

    #[error("event bus has shut down")]
    BusShutDown,

    #[error("audit log error: {detail}")]
    Audit { detail: String },

    #[error("component '{component}' is unhealthy and recovery was exhausted")]
    ComponentUnavailable { component: String },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
