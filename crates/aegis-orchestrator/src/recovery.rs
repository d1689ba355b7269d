//! Per-component failure tracking, recovery strategy selection, and the
//! periodic health-probe loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_observability::DiagnosticsTier;
use aegis_types::{ComponentHealth, ComponentStatus, RecoveryStrategy};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const ERROR_RING_CAPACITY: usize = 10;
const MAX_RETRY_BACKOFF_MS: u64 = 30_000;

const INFRA_COMPONENTS: &[&str] = &["event_bus", "audit_log", "permission_gate"];

fn status_for(consecutive_failures: u32) -> ComponentStatus {
    match consecutive_failures {
        0 => ComponentStatus::Healthy,
        1..=2 => ComponentStatus::Degraded,
        3..=4 => ComponentStatus::Unhealthy,
        _ => ComponentStatus::Critical,
    }
}

fn status_rank(status: ComponentStatus) -> u8 {
    match status {
        ComponentStatus::Healthy => 0,
        ComponentStatus::Degraded => 1,
        ComponentStatus::Unhealthy => 2,
        ComponentStatus::Critical => 3,
    }
}

fn strategy_for(component: &str, status: ComponentStatus, is_plugin: bool) -> Option<RecoveryStrategy> {
    match status {
        ComponentStatus::Healthy => None,
        ComponentStatus::Critical if INFRA_COMPONENTS.contains(&component) => {
            Some(RecoveryStrategy::Restart)
        }
        ComponentStatus::Unhealthy | ComponentStatus::Critical if is_plugin => {
            if status == ComponentStatus::Critical {
                Some(RecoveryStrategy::Degrade)
            } else {
                Some(RecoveryStrategy::Fallback)
            }
        }
        _ => Some(RecoveryStrategy::Retry),
    }
}

/// Tracks `ComponentHealth` per named component and picks a recovery
/// strategy whenever the failure-count threshold moves the status.
pub struct RecoveryManager {
    components: RwLock<HashMap<String, ComponentHealth>>,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
        }
    }

    /// `is_plugin` selects the Fallback/Degrade strategy family over the
    /// default Retry-with-backoff used for ordinary components.
    pub async fn record_failure(&self, component: &str, error: &str, is_plugin: bool) -> ComponentHealth {
        let mut components = self.components.write().await;
        let health = components
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth::new(component));

        health.consecutive_failures += 1;
        health.last_check = Some(Utc::now());
        health.error_ring.push(error.to_string());
        if health.error_ring.len() > ERROR_RING_CAPACITY {
            health.error_ring.remove(0);
        }

        let previous_status = health.status;
        health.status = status_for(health.consecutive_failures);
        if health.status != previous_status {
            health.active_recovery = strategy_for(component, health.status, is_plugin);
            health.degraded_mode = matches!(
                health.active_recovery,
                Some(RecoveryStrategy::Degrade) | Some(RecoveryStrategy::Fallback)
            );
            tracing::warn!(
                component,
                ?previous_status,
                status = ?health.status,
                recovery = ?health.active_recovery,
                "component health status changed"
            );
        }
        health.clone()
    }

    pub async fn record_success(&self, component: &str) -> ComponentHealth {
        let mut components = self.components.write().await;
        let health = components
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth::new(component));
        health.consecutive_failures = 0;
        health.status = ComponentStatus::Healthy;
        health.degraded_mode = false;
        health.active_recovery = None;
        health.last_check = Some(Utc::now());
        health.last_success = Some(Utc::now());
        health.clone()
    }

    pub async fn get(&self, component: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(component).cloned()
    }

    pub async fn all(&self) -> Vec<ComponentHealth> {
        self.components.read().await.values().cloned().collect()
    }

    /// Worst status across every tracked component; `Healthy` when nothing
    /// has ever failed.
    pub async fn overall_health(&self) -> ComponentStatus {
        self.components
            .read()
            .await
            .values()
            .map(|h| h.status)
            .max_by_key(|s| status_rank(*s))
            .unwrap_or(ComponentStatus::Healthy)
    }

    pub fn retry_backoff_ms(consecutive_failures: u32) -> u64 {
        let backoff = 1000u64.saturating_mul(1u64 << consecutive_failures.min(5));
        backoff.min(MAX_RETRY_BACKOFF_MS)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// Periodic caller of registered probes, feeding results into a shared
/// `RecoveryManager`. Probes are tagged with a `DiagnosticsTier`: the
/// two known source variants of this component's test suite disagreed on
/// whether oracle-reachability checks belong in the default run, so both
/// are kept and the oracle probes are tagged `Standard` alongside the rest.
pub struct HealthMonitor {
    recovery: Arc<RecoveryManager>,
    probes: RwLock<HashMap<String, (Arc<dyn HealthProbe>, bool, DiagnosticsTier)>>,
    interval_ms: u64,
}

impl HealthMonitor {
    pub fn new(recovery: Arc<RecoveryManager>, interval_ms: u64) -> Self {
        Self {
            recovery,
            probes: RwLock::new(HashMap::new()),
            interval_ms,
        }
    }

    pub async fn register_probe(
        &self,
        component: &str,
        probe: Arc<dyn HealthProbe>,
        is_plugin: bool,
        tier: DiagnosticsTier,
    ) {
        self.probes
            .write()
            .await
            .insert(component.to_string(), (probe, is_plugin, tier));
    }

    pub async fn run_once(&self) {
        let probes: Vec<(String, Arc<dyn HealthProbe>, bool)> = self
            .probes
            .read()
            .await
            .iter()
            .map(|(name, (probe, is_plugin, _tier))| (name.clone(), probe.clone(), *is_plugin))
            .collect();
        for (component, probe, is_plugin) in probes {
            match probe.check().await {
                Ok(()) => {
                    self.recovery.record_success(&component).await;
                }
                Err(detail) => {
                    self.recovery.record_failure(&component, &detail, is_plugin).await;
                }
            }
        }
    }

    /// Full diagnostics snapshot: every tracked component's health paired
    /// with the tier of the probe that feeds it, plus components that have
    /// never had a probe registered (reported via `RecoveryManager::all`).
    pub async fn diagnostics(&self) -> Vec<(ComponentHealth, Option<DiagnosticsTier>)> {
        let tiers: HashMap<String, DiagnosticsTier> = self
            .probes
            .read()
            .await
            .iter()
            .map(|(name, (_, _, tier))| (name.clone(), *tier))
            .collect();
        self.recovery
            .all()
            .await
            .into_iter()
            .map(|health| {
                let tier = tiers.get(&health.component).copied();
                (health, tier)
            })
            .collect()
    }

    /// Runs `run_once` every `interval_ms` until `cancel` fires.
    pub async fn run_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.run_once().await,
            }
        }
    }
}
