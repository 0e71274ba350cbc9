use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures::{future::join_all, FutureExt};
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};

use crate::{
    config,
    error::PluginError,
    events::{EventBus, LifecycleEvent},
    host::PluginInstance,
    registry::{HealthStatus, Registry, RegistryEntry, RuntimeStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub overall_health: OverallHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    BecameHealthy,
    BecameUnhealthy,
}

/// Periodically probes every running plugin and keeps its health record
/// (stored in the registry entry) current.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    events: EventBus,
    settings: config::Health,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, events: EventBus, settings: config::Health) -> Self {
        Self {
            registry,
            events,
            settings,
        }
    }

    /// Runs probe rounds every `interval_secs` until `shutdown` flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            tracing::info!(interval_secs = self.settings.interval_secs, "health monitor started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            tracing::info!("health monitor stopped");
        })
    }

    /// Probes every running plugin concurrently. Returns how many results
    /// were applied.
    pub async fn run_once(&self) -> usize {
        let targets = self.registry.probe_targets();
        let limit = self.settings.timeout();
        let results = join_all(
            targets
                .into_iter()
                .map(|(id, instance)| async move {
                    let outcome = probe(&id, instance, limit).await;
                    (id, outcome)
                }),
        )
        .await;

        let mut applied = 0;
        for (id, outcome) in results {
            let label = if outcome.is_ok() { "success" } else { "failure" };
            metrics::counter!("ksp_health_probes_total", "outcome" => label).increment(1);
            if let Some(transition) = self.apply(&id, outcome) {
                applied += 1;
                self.publish(&id, transition);
            } else if self.registry.contains(&id) {
                applied += 1;
            } else {
                tracing::debug!(plugin = %id, "discarding probe result for unloaded plugin");
            }
        }
        applied
    }

    /// Records one probe outcome. Returns a transition when the health
    /// status flipped. Results for entries that vanished or stopped running
    /// are dropped.
    fn apply(&self, id: &str, outcome: Result<(), String>) -> Option<Transition> {
        let healthy_threshold = self.settings.healthy_threshold;
        let unhealthy_threshold = self.settings.unhealthy_threshold;
        self.registry
            .update(id, |entry| record_outcome(entry, outcome, healthy_threshold, unhealthy_threshold))
            .flatten()
    }

    fn publish(&self, id: &str, transition: Transition) {
        let event = match transition {
            Transition::BecameHealthy => LifecycleEvent::PluginHealthy { id: id.to_string() },
            Transition::BecameUnhealthy => {
                let detail = self
                    .registry
                    .get(id)
                    .and_then(|info| info.health.error)
                    .unwrap_or_default();
                LifecycleEvent::PluginUnhealthy {
                    id: id.to_string(),
                    detail,
                }
            }
        };
        self.events.publish(event);
    }

    pub fn summary(&self) -> HealthSummary {
        summarize(self.registry.health_records().iter().map(|record| record.status))
    }
}

async fn probe(
    id: &str,
    instance: Arc<dyn PluginInstance>,
    limit: Duration,
) -> Result<(), String> {
    let guarded = AssertUnwindSafe(instance.probe()).catch_unwind();
    match timeout(limit, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("health probe panicked".to_string()),
        Err(_) => Err(PluginError::ProbeTimeout(id.to_string()).to_string()),
    }
}

fn record_outcome(
    entry: &mut RegistryEntry,
    outcome: Result<(), String>,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
) -> Option<Transition> {
    if !entry.status.is_running() {
        return None;
    }
    let record = &mut entry.health;
    record.last_checked = Some(Utc::now());
    record.total_checks += 1;
    match outcome {
        Ok(()) => {
            record.consecutive_successes = record.consecutive_successes.saturating_add(1);
            record.consecutive_failures = 0;
            record.error = None;
            if record.consecutive_successes < healthy_threshold {
                return None;
            }
            entry.status = RuntimeStatus::Active;
            let flipped = record.status != HealthStatus::Healthy;
            record.status = HealthStatus::Healthy;
            flipped.then_some(Transition::BecameHealthy)
        }
        Err(reason) => {
            tracing::debug!(plugin = %record.plugin_id, %reason, "health probe failed");
            record.total_failures += 1;
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.consecutive_successes = 0;
            record.error = Some(reason);
            if record.consecutive_failures < unhealthy_threshold {
                entry.status = RuntimeStatus::Degraded;
                return None;
            }
            entry.status = RuntimeStatus::Unhealthy;
            let flipped = record.status != HealthStatus::Unhealthy;
            record.status = HealthStatus::Unhealthy;
            flipped.then_some(Transition::BecameUnhealthy)
        }
    }
}

/// Overall health is `healthy` with no unhealthy plugins, `unhealthy` when
/// they outnumber the healthy ones and `degraded` otherwise.
pub fn summarize(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthSummary {
    let mut summary = HealthSummary {
        total: 0,
        healthy: 0,
        unhealthy: 0,
        unknown: 0,
        overall_health: OverallHealth::Healthy,
    };
    for status in statuses {
        summary.total += 1;
        match status {
            HealthStatus::Healthy => summary.healthy += 1,
            HealthStatus::Unhealthy => summary.unhealthy += 1,
            HealthStatus::Unknown => summary.unknown += 1,
        }
    }
    summary.overall_health = if summary.unhealthy == 0 {
        OverallHealth::Healthy
    } else if summary.unhealthy > summary.healthy {
        OverallHealth::Unhealthy
    } else {
        OverallHealth::Degraded
    };
    summary
}
