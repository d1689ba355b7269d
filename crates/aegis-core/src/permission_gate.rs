//! Bounded-wait approval broker.
//!
//! Adapted from the teacher's `PermissionManager` (wait/reply over a
//! `tokio::sync::watch` channel per outstanding request) generalized to the
//! orchestration core's three-level model (`AutoApprove`, `RequireConfirmation`,
//! `AdminOnly`) with an explicit timeout and cancellation-token support.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_types::{Event, EventPriority, OrchestratorError, PermissionLevel, PermissionRequest, PermissionResponse};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event_bus::EventBus;

#[derive(Debug, Clone)]
pub struct PermissionStatistics {
    pub outstanding: usize,
    pub answered: usize,
    pub average_wait_ms: f64,
}

struct Waiter {
    tx: watch::Sender<Option<PermissionResponse>>,
}

#[derive(Default)]
struct Stats {
    answered: usize,
    total_wait_ms: u64,
}

pub struct PermissionGate {
    event_bus: EventBus,
    outstanding: Arc<RwLock<HashMap<String, PermissionRequest>>>,
    waiters: Arc<RwLock<HashMap<String, Waiter>>>,
    stats: Arc<RwLock<Stats>>,
    default_timeout_ms: u64,
}

impl PermissionGate {
    pub fn new(event_bus: EventBus, default_timeout_ms: u64) -> Self {
        Self {
            event_bus,
            outstanding: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(Stats::default())),
            default_timeout_ms,
        }
    }

    /// For `AutoApprove`, resolves synchronously without user interaction.
    /// Otherwise creates a `PermissionRequest`, emits a `PermissionRequest`
    /// event, and waits up to `timeout` for a matching `respond`. On
    /// timeout, returns denied with reason "timeout". Cancellation of
    /// `cancel` resolves the waiter with a denied result.
    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        client_id: &str,
        step_id: &str,
        tool: &str,
        description: &str,
        params: HashMap<String, Value>,
        level: PermissionLevel,
        cancel: &CancellationToken,
    ) -> Result<PermissionResponse, OrchestratorError> {
        if level == PermissionLevel::AutoApprove {
            return Ok(PermissionResponse {
                approved: true,
                reason: None,
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let timeout_ms = self.default_timeout_ms;
        let request = PermissionRequest {
            id: request_id.clone(),
            client_id: client_id.to_string(),
            step_id: step_id.to_string(),
            tool: tool.to_string(),
            description: description.to_string(),
            parameters: params,
            level,
            requested_at: now,
            expires_at: now + ChronoDuration::milliseconds(timeout_ms as i64),
        };

        self.outstanding
            .write()
            .await
            .insert(request_id.clone(), request.clone());

        let (tx, mut rx) = watch::channel(None);
        self.waiters
            .write()
            .await
            .insert(request_id.clone(), Waiter { tx });

        let _ = self
            .event_bus
            .publish(Event::new(
                "PermissionRequest",
                EventPriority::High,
                "permission_gate",
                json!({
                    "request_id": request_id,
                    "client_id": client_id,
                    "step_id": step_id,
                    "tool": tool,
                    "description": description,
                }),
            ))
            .await;

        let wait_started = std::time::Instant::now();
        let response = tokio::select! {
            _ = cancel.cancelled() => PermissionResponse { approved: false, reason: Some("cancelled".into()) },
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), rx.changed()) => {
                match result {
                    Ok(Ok(())) => rx.borrow().clone().unwrap_or(PermissionResponse {
                        approved: false,
                        reason: Some("timeout".into()),
                    }),
                    _ => PermissionResponse { approved: false, reason: Some("timeout".into()) },
                }
            }
        };

        self.finalize(&request_id, wait_started.elapsed().as_millis() as u64)
            .await;

        Ok(response)
    }

    /// Resolves exactly one outstanding request. Further calls for the same
    /// id are no-ops.
    pub async fn respond(&self, request_id: &str, approved: bool, reason: Option<String>) {
        let waiters = self.waiters.read().await;
        if let Some(waiter) = waiters.get(request_id) {
            let _ = waiter.tx.send(Some(PermissionResponse { approved, reason }));
        }
    }

    async fn finalize(&self, request_id: &str, wait_ms: u64) {
        self.outstanding.write().await.remove(request_id);
        self.waiters.write().await.remove(request_id);
        let mut stats = self.stats.write().await;
        stats.answered += 1;
        stats.total_wait_ms += wait_ms;
    }

    pub async fn statistics(&self) -> PermissionStatistics {
        let outstanding = self.outstanding.read().await.len();
        let stats = self.stats.read().await;
        let average_wait_ms = if stats.answered == 0 {
            0.0
        } else {
            stats.total_wait_ms as f64 / stats.answered as f64
        };
        PermissionStatistics {
            outstanding,
            answered: stats.answered,
            average_wait_ms,
        }
    }

    pub async fn list_outstanding(&self) -> Vec<PermissionRequest> {
        self.outstanding.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_approve_resolves_without_waiting() {
        let gate = PermissionGate::new(EventBus::new(), 1_000);
        let cancel = CancellationToken::new();
        let response = gate
            .request(
                "client-a",
                "step-1",
                "bash",
                "run a command",
                HashMap::new(),
                PermissionLevel::AutoApprove,
                &cancel,
            )
            .await
            .unwrap();
        assert!(response.approved);
    }

    #[tokio::test]
    async fn timeout_denies_with_reason() {
        let gate = Arc::new(PermissionGate::new(EventBus::new(), 50));
        let cancel = CancellationToken::new();
        let response = gate
            .request(
                "client-a",
                "step-1",
                "bash",
                "run a command",
                HashMap::new(),
                PermissionLevel::RequireConfirmation,
                &cancel,
            )
            .await
            .unwrap();
        assert!(!response.approved);
        assert_eq!(response.reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn respond_resolves_the_waiter() {
        let gate = Arc::new(PermissionGate::new(EventBus::new(), 5_000));
        let gate_clone = gate.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move {
            gate_clone
                .request(
                    "client-a",
                    "step-1",
                    "bash",
                    "run a command",
                    HashMap::new(),
                    PermissionLevel::RequireConfirmation,
                    &cancel,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let outstanding = gate.list_outstanding().await;
        assert_eq!(outstanding.len(), 1);
        gate.respond(&outstanding[0].id, true, None).await;

        let response = handle.await.unwrap().unwrap();
        assert!(response.approved);
    }

    #[tokio::test]
    async fn cancellation_denies_the_waiter() {
        let gate = Arc::new(PermissionGate::new(EventBus::new(), 5_000));
        let gate_clone = gate.clone();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            gate_clone
                .request(
                    "client-a",
                    "step-1",
                    "bash",
                    "run a command",
                    HashMap::new(),
                    PermissionLevel::RequireConfirmation,
                    &cancel_clone,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let response = handle.await.unwrap().unwrap();
        assert!(!response.approved);
    }
}
