use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use ksp_plugin_sdk::Manifest;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    artifact::LoadedArtifact,
    error::{PluginError, Result},
    fetch::PluginSource,
    host::PluginInstance,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Loading,
    Active,
    Degraded,
    Unhealthy,
    Unloading,
    Failed,
}

impl RuntimeStatus {
    /// Entries in these states are probed and may serve traffic.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Degraded | Self::Unhealthy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub plugin_id: String,
    pub status: HealthStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub total_failures: u64,
}

impl HealthRecord {
    pub fn unknown(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            status: HealthStatus::Unknown,
            last_checked: None,
            error: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            total_failures: 0,
        }
    }
}

/// Recent errors kept per plugin.
pub const ERROR_HISTORY: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Request and error counters for one plugin. Survives reloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PluginStats {
    pub requests: u64,
    pub errors: u64,
    pub recent_errors: VecDeque<ErrorRecord>,
}

impl PluginStats {
    fn push_error(&mut self, kind: &str, message: String) {
        self.errors += 1;
        if self.recent_errors.len() == ERROR_HISTORY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(ErrorRecord {
            kind: kind.to_string(),
            message,
            at: Utc::now(),
        });
    }
}

/// Totals across every registered plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryMetrics {
    pub total_plugins: usize,
    pub healthy_plugins: usize,
    pub unhealthy_plugins: usize,
    pub unknown_plugins: usize,
    pub total_routes: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}

pub struct RegistryEntry {
    pub manifest: Arc<Manifest>,
    pub artifact: LoadedArtifact,
    pub source: PluginSource,
    pub status: RuntimeStatus,
    pub enabled: bool,
    pub loaded_at: DateTime<Utc>,
    pub routes: Vec<String>,
    pub health: HealthRecord,
    pub stats: PluginStats,
}

impl RegistryEntry {
    pub fn new(manifest: Arc<Manifest>, artifact: LoadedArtifact, source: PluginSource) -> Self {
        let health = HealthRecord::unknown(&manifest.id);
        Self {
            manifest,
            artifact,
            source,
            status: RuntimeStatus::Loading,
            enabled: true,
            loaded_at: Utc::now(),
            routes: Vec::new(),
            health,
            stats: PluginStats::default(),
        }
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            description: self.manifest.description.clone(),
            status: self.status,
            enabled: self.enabled,
            loaded_at: self.loaded_at,
            routes: self.routes.clone(),
            permissions: self.manifest.permissions.clone(),
            artifact_path: self.artifact.path.clone(),
            checksum: self.artifact.checksum.clone(),
            size: self.artifact.size,
            source: self.source.clone(),
            health: self.health.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Owned snapshot of an entry, safe to hand out after the lock is released.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub status: RuntimeStatus,
    pub enabled: bool,
    pub loaded_at: DateTime<Utc>,
    pub routes: Vec<String>,
    pub permissions: Vec<String>,
    pub artifact_path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub source: PluginSource,
    pub health: HealthRecord,
    pub stats: PluginStats,
}

/// What the HTTP layer needs to dispatch into a plugin.
#[derive(Clone)]
pub struct DispatchTarget {
    pub instance: Arc<dyn PluginInstance>,
    pub enabled: bool,
    pub status: RuntimeStatus,
}

/// The authoritative map of loaded plugins, keyed by id.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: RegistryEntry) -> Result<()> {
        let mut entries = self.entries.write();
        let id = entry.manifest.id.clone();
        if entries.contains_key(&id) {
            return Err(PluginError::AlreadyRegistered(id));
        }
        entries.insert(id, entry);
        Ok(())
    }

    /// Removes and returns the entry so the caller can stop its instance
    /// outside the lock.
    pub fn deregister(&self, id: &str) -> Result<RegistryEntry> {
        self.entries
            .write()
            .remove(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Swaps in a new entry for an existing id, returning the old one. The
    /// counters move to the new entry.
    pub fn replace(&self, mut entry: RegistryEntry) -> Result<RegistryEntry> {
        let mut entries = self.entries.write();
        let id = entry.manifest.id.clone();
        match entries.get_mut(&id) {
            Some(slot) => {
                entry.stats = std::mem::take(&mut slot.stats);
                Ok(std::mem::replace(slot, entry))
            }
            None => Err(PluginError::NotFound(id)),
        }
    }

    pub fn get(&self, id: &str) -> Option<PluginInfo> {
        self.entries.read().get(id).map(RegistryEntry::info)
    }

    /// Snapshot of every entry, ordered by id.
    pub fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self.entries.read().values().map(RegistryEntry::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_status(&self, id: &str, status: RuntimeStatus) -> Result<()> {
        self.update(id, |entry| entry.status = status)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.update(id, |entry| entry.enabled = enabled)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Runs `f` on the entry under the write lock. `f` must not block.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut RegistryEntry) -> R) -> Option<R> {
        self.entries.write().get_mut(id).map(f)
    }

    pub fn record_request(&self, id: &str) {
        self.update(id, |entry| entry.stats.requests += 1);
    }

    pub fn record_error(&self, id: &str, kind: &str, message: impl Into<String>) {
        let message = message.into();
        self.update(id, |entry| entry.stats.push_error(kind, message));
    }

    /// Drops the recent error list; the running total is kept.
    pub fn clear_errors(&self, id: &str) -> Result<()> {
        self.update(id, |entry| entry.stats.recent_errors.clear())
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let entries = self.entries.read();
        let mut metrics = RegistryMetrics {
            total_plugins: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.health.status {
                HealthStatus::Healthy => metrics.healthy_plugins += 1,
                HealthStatus::Unhealthy => metrics.unhealthy_plugins += 1,
                HealthStatus::Unknown => metrics.unknown_plugins += 1,
            }
            metrics.total_routes += entry.routes.len();
            metrics.total_requests += entry.stats.requests;
            metrics.total_errors += entry.stats.errors;
        }
        metrics
    }

    pub fn instance(&self, id: &str) -> Option<Arc<dyn PluginInstance>> {
        self.entries
            .read()
            .get(id)
            .map(|entry| entry.artifact.instance.clone())
    }

    pub fn dispatch_target(&self, id: &str) -> Option<DispatchTarget> {
        self.entries.read().get(id).map(|entry| DispatchTarget {
            instance: entry.artifact.instance.clone(),
            enabled: entry.enabled,
            status: entry.status,
        })
    }

    /// Instances the health monitor should probe this round.
    pub fn probe_targets(&self) -> Vec<(String, Arc<dyn PluginInstance>)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.status.is_running())
            .map(|(id, entry)| (id.clone(), entry.artifact.instance.clone()))
            .collect()
    }

    pub fn health_records(&self) -> Vec<HealthRecord> {
        self.entries
            .read()
            .values()
            .map(|entry| entry.health.clone())
            .collect()
    }

    pub fn manifest(&self, id: &str) -> Option<Arc<Manifest>> {
        self.entries.read().get(id).map(|entry| entry.manifest.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::host::{HttpRequest, HttpResponse};

    pub(crate) struct Inert;

    #[async_trait]
    impl PluginInstance for Inert {
        async fn probe(&self) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn dispatch(&self, _: &str, _: HttpRequest) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse::default())
        }
        async fn shutdown(&self) {}
    }

    pub(crate) fn entry(id: &str, version: &str) -> RegistryEntry {
        let manifest = Manifest {
            id: id.into(),
            name: id.into(),
            version: version.into(),
            ..Default::default()
        };
        RegistryEntry::new(
            Arc::new(manifest),
            LoadedArtifact {
                instance: Arc::new(Inert),
                path: PathBuf::from(format!("/plugins/{id}/{id}")),
                checksum: "ab".repeat(32),
                size: 42,
            },
            PluginSource::Directory {
                path: PathBuf::from(format!("/src/{id}")),
            },
        )
    }

    #[test]
    fn duplicate_registration_keeps_the_first_entry() {
        let registry = Registry::new();
        registry.register(entry("demo", "1.0.0")).unwrap();
        let err = registry.register(entry("demo", "2.0.0")).unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered(ref id) if id == "demo"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("demo").unwrap().version, "1.0.0");
    }

    #[test]
    fn deregistering_unknown_id_changes_nothing() {
        let registry = Registry::new();
        registry.register(entry("demo", "1.0.0")).unwrap();
        assert!(matches!(
            registry.deregister("ghost"),
            Err(PluginError::NotFound(_))
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.deregister("demo").is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn status_changes_show_in_snapshots() {
        let registry = Registry::new();
        registry.register(entry("demo", "1.0.0")).unwrap();
        assert_eq!(registry.get("demo").unwrap().status, RuntimeStatus::Loading);
        assert!(registry.probe_targets().is_empty());

        registry.set_status("demo", RuntimeStatus::Active).unwrap();
        registry.set_enabled("demo", false).unwrap();
        let info = registry.get("demo").unwrap();
        assert_eq!(info.status, RuntimeStatus::Active);
        assert!(!info.enabled);
        assert_eq!(registry.probe_targets().len(), 1);
        assert!(registry.set_status("ghost", RuntimeStatus::Active).is_err());
    }

    #[test]
    fn replace_swaps_existing_entries_only() {
        let registry = Registry::new();
        assert!(registry.replace(entry("demo", "2.0.0")).is_err());
        registry.register(entry("demo", "1.0.0")).unwrap();
        let old = registry.replace(entry("demo", "2.0.0")).unwrap();
        assert_eq!(old.manifest.version, "1.0.0");
        assert_eq!(registry.get("demo").unwrap().version, "2.0.0");
    }

    #[test]
    fn counters_accumulate_and_survive_replace() {
        let registry = Registry::new();
        registry.register(entry("demo", "1.0.0")).unwrap();
        registry.record_request("demo");
        registry.record_request("demo");
        for n in 0..(ERROR_HISTORY + 2) {
            registry.record_error("demo", "dispatch", format!("failure {n}"));
        }
        registry.record_request("ghost");

        let stats = registry.get("demo").unwrap().stats;
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, ERROR_HISTORY as u64 + 2);
        assert_eq!(stats.recent_errors.len(), ERROR_HISTORY);
        assert_eq!(stats.recent_errors[0].message, "failure 2");

        registry.replace(entry("demo", "2.0.0")).unwrap();
        registry.update("demo", |entry| entry.routes = vec!["GET /x".into()]);
        let metrics = registry.metrics();
        assert_eq!(metrics.total_plugins, 1);
        assert_eq!(metrics.unknown_plugins, 1);
        assert_eq!(metrics.total_routes, 1);
        assert_eq!(metrics.total_requests, 2);

        registry.clear_errors("demo").unwrap();
        let stats = registry.get("demo").unwrap().stats;
        assert!(stats.recent_errors.is_empty());
        assert_eq!(stats.errors, ERROR_HISTORY as u64 + 2);
        assert!(registry.clear_errors("ghost").is_err());
    }

    #[test]
    fn list_is_sorted_by_id() {
        let registry = Registry::new();
        for id in ["zeta", "alpha", "mid"] {
            registry.register(entry(id, "1.0.0")).unwrap();
        }
        let ids: Vec<String> = registry.list().into_iter().map(|info| info.id).collect();
        assert_eq!(ids, ["alpha", "mid", "zeta"]);
    }
}
