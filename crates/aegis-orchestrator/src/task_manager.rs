//! Per-client concurrent task registry: admission control, state transitions,
//! context-update routing, and retention-delayed cleanup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aegis_core::EventBus;
use aegis_types::{ActiveTask, ContextUpdate, Event, EventPriority, OrchestratorError, TaskState};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;

const COMPLETION_RETENTION: Duration = Duration::from_secs(60);
const CANCELLATION_RETENTION: Duration = Duration::from_secs(5);
const RELATED_TASK_OVERLAP_THRESHOLD: f64 = 0.3;
const MIN_KEYWORD_LEN: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "that", "this", "with", "you", "your", "what", "how",
    "can", "please", "just", "about",
];

pub struct TaskManager {
    event_bus: EventBus,
    tasks: Arc<RwLock<HashMap<String, ActiveTask>>>,
    max_concurrent_per_client: usize,
}

impl TaskManager {
    pub fn new(event_bus: EventBus, max_concurrent_per_client: usize) -> Self {
        Self {
            event_bus,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            max_concurrent_per_client,
        }
    }

    pub async fn create(&self, client_id: &str, query: &str) -> Result<ActiveTask, OrchestratorError> {
        let tasks = self.tasks.read().await;
        let active_count = tasks
            .values()
            .filter(|t| t.client_id == client_id && !t.state.is_terminal())
            .count();
        if active_count >= self.max_concurrent_per_client {
            return Err(OrchestratorError::TooManyTasks {
                client_id: client_id.to_string(),
                limit: self.max_concurrent_per_client,
            });
        }
        drop(tasks);

        let task = ActiveTask::new(client_id, query);
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    /// No-op if the task is unknown or already in the requested state.
    /// Publishes `TaskStateChanged` on every actual transition.
    pub async fn update_state(&self, task_id: &str, state: TaskState) {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        if task.state == state {
            return;
        }
        let previous = task.state;
        task.set_state(state, Utc::now());
        drop(tasks);

        let _ = self
            .event_bus
            .publish(Event::new(
                "TaskStateChanged",
                EventPriority::Low,
                "task_manager",
                json!({"task_id": task_id, "previous_state": previous, "state": state}),
            ))
            .await;
    }

    pub async fn add_context_update(&self, task_id: &str, message: &str) -> Option<ContextUpdate> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id)?;
        let update = ContextUpdate::new(task_id, message);
        task.context_updates.push(update.clone());
        drop(tasks);

        let _ = self
            .event_bus
            .publish(Event::new(
                "ContextUpdate",
                EventPriority::Medium,
                "task_manager",
                json!({"task_id": task_id, "message": message}),
            ))
            .await;
        Some(update)
    }

    /// The most recent Active/Paused task for `client_id` whose query shares
    /// more than 30% of its significant keywords with `query`.
    pub async fn find_related_task(&self, client_id: &str, query: &str) -> Option<ActiveTask> {
        let tasks = self.tasks.read().await;
        let query_tokens = keywords(query);
        if query_tokens.is_empty() {
            return None;
        }
        tasks
            .values()
            .filter(|t| {
                t.client_id == client_id
                    && matches!(t.state, TaskState::Active | TaskState::Paused)
            })
            .filter(|t| keyword_overlap(&query_tokens, &keywords(&t.query)) > RELATED_TASK_OVERLAP_THRESHOLD)
            .max_by_key(|t| t.created_at)
            .cloned()
    }

    pub async fn get(&self, task_id: &str) -> Option<ActiveTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn list_for_client(&self, client_id: &str) -> Vec<ActiveTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.client_id == client_id)
            .cloned()
            .collect()
    }

    pub async fn complete(&self, task_id: &str, result: Value) {
        self.finish(task_id, TaskState::Completed, result, COMPLETION_RETENTION)
            .await;
    }

    pub async fn cancel(&self, task_id: &str) {
        self.finish(task_id, TaskState::Cancelled, Value::Null, CANCELLATION_RETENTION)
            .await;
    }

    async fn finish(&self, task_id: &str, state: TaskState, _result: Value, retention: Duration) {
        self.update_state(task_id, state).await;
        let tasks = self.tasks.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            tasks.write().await.remove(&task_id);
        });
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > MIN_KEYWORD_LEN && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn keyword_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let smaller = a.len().min(b.len());
    intersection as f64 / smaller as f64
}
