use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use http::Method;
use ksp_plugin_sdk::{parse_manifest, Manifest, MANIFEST_FILE};
use serde::Serialize;
use tokio::{
    fs,
    sync::{watch, Mutex, OwnedMutexGuard},
    task::JoinHandle,
};

use crate::{
    artifact::{ArtifactLoader, LoadedArtifact},
    build::{BuildPipeline, CacheInfo},
    config::{self, Config},
    error::{PluginError, Result},
    events::{EventBus, LifecycleEvent, Stamped},
    fetch::{repo_allowed, GitFetcher, PluginSource, SourceFetcher},
    health::{HealthMonitor, HealthSummary},
    host::PluginHost,
    registry::{
        DispatchTarget, HealthRecord, HealthStatus, PluginInfo, Registry, RegistryEntry,
        RegistryMetrics, RuntimeStatus,
    },
    routes::{Resolution, RouteTable},
    store::{InstalledRecord, JsonStore, MetadataStore},
};

/// Outcome of a static artifact check.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub id: String,
    pub version: String,
    pub artifact: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub routes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Everything needed to launch a plugin after fetching and building.
struct Prepared {
    manifest: Manifest,
    artifact: PathBuf,
    /// Held from admission until activation finishes; `None` when the caller
    /// already holds it.
    lock: Option<OwnedMutexGuard<()>>,
}

/// One async mutex per plugin id. Lifecycle operations on the same id run
/// one at a time; different ids proceed in parallel.
#[derive(Default)]
struct LifecycleLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleLocks {
    async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(id.to_string()).or_default().clone();
        lock.lock_owned().await
    }
}

/// Owns the plugin lifecycle: fetch, build, load, expose, reload and
/// unload, publishing an event for every outcome.
pub struct PluginManager {
    settings: config::Plugins,
    registry: Arc<Registry>,
    routes: Arc<RouteTable>,
    loader: ArtifactLoader,
    builder: BuildPipeline,
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn MetadataStore>,
    events: EventBus,
    health: Arc<HealthMonitor>,
    locks: LifecycleLocks,
}

impl PluginManager {
    pub fn new(config: &Config, host: Arc<dyn PluginHost>) -> Result<Self> {
        let mut settings = config.plugins.clone();
        std::fs::create_dir_all(&settings.root)?;
        settings.root = settings.root.canonicalize()?;
        let registry = Arc::new(Registry::new());
        let events = EventBus::default();
        let routes = Arc::new(RouteTable::new(
            config.routes.prefix.clone(),
            config.routes.on_conflict,
        ));
        let loader = ArtifactLoader::new(
            settings.root.clone(),
            config.loader.max_artifact_bytes,
            config.loader.load_timeout(),
            host,
        );
        let builder = BuildPipeline::open(config.build.clone(), settings.cache_dir.clone())?;
        let fetcher = Arc::new(GitFetcher::new(config.build.fetch_timeout()));
        let store = Arc::new(JsonStore::new(&settings.root));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            events.clone(),
            config.health.clone(),
        ));
        Ok(Self {
            settings,
            registry,
            routes,
            loader,
            builder,
            fetcher,
            store,
            events,
            health,
            locks: LifecycleLocks::default(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = store;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Stamped> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Starts the periodic health probes.
    pub fn start_health_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.health.clone().spawn(shutdown)
    }

    pub async fn load_from_source(&self, source: PluginSource) -> Result<PluginInfo> {
        let mut subject = source.to_string();
        let result = self.load_inner(&source, &mut subject).await;
        if let Err(err) = &result {
            self.report_failure(&subject, err);
        }
        result
    }

    pub async fn load_from_directory(&self, dir: impl Into<PathBuf>) -> Result<PluginInfo> {
        self.load_from_source(PluginSource::Directory { path: dir.into() })
            .await
    }

    pub async fn load_from_git(&self, url: &str, reference: Option<&str>) -> Result<PluginInfo> {
        self.load_from_source(PluginSource::Git {
            url: url.to_string(),
            reference: reference.map(str::to_string),
        })
        .await
    }

    /// Loads a prebuilt executable; no build step runs.
    pub async fn load_from_artifact(
        &self,
        artifact: impl Into<PathBuf>,
        manifest: impl Into<PathBuf>,
    ) -> Result<PluginInfo> {
        self.load_from_source(PluginSource::Artifact {
            artifact: artifact.into(),
            manifest: manifest.into(),
        })
        .await
    }

    async fn load_inner(&self, source: &PluginSource, subject: &mut String) -> Result<PluginInfo> {
        let Prepared {
            manifest,
            artifact,
            lock: _lock,
        } = self.prepare(source, subject, false).await?;
        let info = self.activate(manifest, &artifact, source.clone()).await?;
        metrics::counter!("ksp_plugin_loads_total", "outcome" => "success").increment(1);
        self.events.publish(LifecycleEvent::PluginLoaded {
            id: info.id.clone(),
            version: info.version.clone(),
        });
        Ok(info)
    }

    /// Fetches and builds as the source requires, returning the manifest and
    /// the artifact path to load.
    async fn prepare(
        &self,
        source: &PluginSource,
        subject: &mut String,
        reloading: bool,
    ) -> Result<Prepared> {
        match source {
            PluginSource::Directory { path } => {
                self.prepare_directory(path, subject, reloading).await
            }
            PluginSource::Git { url, reference } => {
                if !repo_allowed(url, &self.settings.allowed_repos) {
                    return Err(PluginError::SourceNotAllowed(url.clone()));
                }
                let checkout = tempfile::Builder::new().prefix("ksp-fetch-").tempdir()?;
                let dest = checkout.path().join("src");
                self.fetcher
                    .fetch(url, reference.as_deref(), &dest)
                    .await?;
                self.prepare_directory(&dest, subject, reloading).await
            }
            PluginSource::Artifact { artifact, manifest } => {
                let manifest = read_manifest(manifest).await?;
                *subject = manifest.id.clone();
                let lock = self.lock_unless(reloading, &manifest.id).await;
                self.admit(&manifest, reloading)?;
                Ok(Prepared {
                    manifest,
                    artifact: artifact.clone(),
                    lock,
                })
            }
        }
    }

    async fn prepare_directory(
        &self,
        dir: &Path,
        subject: &mut String,
        reloading: bool,
    ) -> Result<Prepared> {
        crate::build::check_source(dir, &self.builder.settings().entry_file)?;
        let manifest = read_manifest(&dir.join(MANIFEST_FILE)).await?;
        *subject = manifest.id.clone();
        let lock = self.lock_unless(reloading, &manifest.id).await;
        self.admit(&manifest, reloading)?;
        let built = self.builder.build(dir, &manifest).await?;
        let artifact = self.install(&manifest, dir, &built.path).await?;
        Ok(Prepared {
            manifest,
            artifact,
            lock,
        })
    }

    async fn lock_unless(&self, held: bool, id: &str) -> Option<OwnedMutexGuard<()>> {
        if held {
            None
        } else {
            Some(self.locks.acquire(id).await)
        }
    }

    /// Cheap checks done before anything is built or launched.
    fn admit(&self, manifest: &Manifest, reloading: bool) -> Result<()> {
        if !reloading && self.registry.contains(&manifest.id) {
            return Err(PluginError::AlreadyRegistered(manifest.id.clone()));
        }
        let allowed = &self.settings.allowed_permissions;
        if !allowed.is_empty() {
            if let Some(denied) = manifest.permissions.iter().find(|p| !allowed.contains(p)) {
                return Err(PluginError::PermissionDenied {
                    id: manifest.id.clone(),
                    permission: denied.clone(),
                });
            }
        }
        for dependency in &manifest.dependencies {
            let unsatisfied = |reason: String| PluginError::DependencyUnsatisfied {
                id: manifest.id.clone(),
                dependency: dependency.id.clone(),
                requirement: dependency.version.clone(),
                reason,
            };
            let Some(loaded) = self.registry.manifest(&dependency.id) else {
                return Err(unsatisfied("not loaded".into()));
            };
            let requirement = dependency.requirement().map_err(|err| unsatisfied(err.to_string()))?;
            let version = semver::Version::parse(&loaded.version).map_err(|_| {
                unsatisfied(format!("loaded version {} is not semver", loaded.version))
            })?;
            if !requirement.matches(&version) {
                return Err(unsatisfied(format!("loaded version is {version}")));
            }
        }
        Ok(())
    }

    /// Copies the built artifact and manifest into `<root>/<id>/` and returns
    /// the artifact path relative to the root. Files are renamed into place
    /// so a running older version keeps its executable.
    async fn install(&self, manifest: &Manifest, source_dir: &Path, built: &Path) -> Result<PathBuf> {
        let dir = self.settings.root.join(&manifest.id);
        fs::create_dir_all(&dir).await?;
        let entry = manifest.entry_name();
        for (from, name) in [(built.to_path_buf(), entry), (source_dir.join(MANIFEST_FILE), MANIFEST_FILE)] {
            let partial = dir.join(format!(".{name}.partial"));
            fs::copy(&from, &partial).await?;
            fs::rename(&partial, dir.join(name)).await?;
        }
        tracing::debug!(plugin = %manifest.id, dir = %dir.display(), "plugin installed");
        Ok(PathBuf::from(&manifest.id).join(entry))
    }

    /// Launches, registers and exposes a plugin. Any failure undoes the
    /// earlier steps.
    async fn activate(
        &self,
        manifest: Manifest,
        artifact: &Path,
        source: PluginSource,
    ) -> Result<PluginInfo> {
        let loaded = self.loader.load(artifact, &manifest).await?;
        let manifest = Arc::new(manifest);
        let id = manifest.id.clone();

        let mut entry = RegistryEntry::new(manifest.clone(), loaded.clone(), source);
        mark_ready(&mut entry.health);
        if let Err(err) = self.registry.register(entry) {
            loaded.instance.shutdown().await;
            return Err(err);
        }

        let mounted = match self.routes.expose(&manifest) {
            Ok(mounted) => mounted,
            Err(err) => {
                self.rollback(&id, &loaded).await;
                return Err(err);
            }
        };
        let updated = self.registry.update(&id, |entry| {
            entry.routes = mounted;
            entry.status = RuntimeStatus::Active;
        });
        if updated.is_none() {
            self.routes.withdraw(&id);
            loaded.instance.shutdown().await;
            return Err(PluginError::NotFound(id));
        }

        if let Err(err) = self.persist(&id).await {
            self.routes.withdraw(&id);
            self.rollback(&id, &loaded).await;
            return Err(err);
        }
        self.registry
            .get(&id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))
    }

    async fn rollback(&self, id: &str, loaded: &LoadedArtifact) {
        if let Ok(entry) = self.registry.deregister(id) {
            if !Arc::ptr_eq(&entry.artifact.instance, &loaded.instance) {
                // Someone else's entry; put it back.
                if let Err(err) = self.registry.register(entry) {
                    tracing::error!(plugin = %id, error = %err, "failed to restore entry during rollback");
                }
            }
        }
        loaded.instance.shutdown().await;
    }

    async fn persist(&self, id: &str) -> Result<()> {
        let Some(info) = self.registry.get(id) else {
            return Ok(());
        };
        let install_path = info
            .artifact_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.store
            .upsert(InstalledRecord {
                id: info.id,
                version: info.version,
                install_method: info.source.install_method().to_string(),
                source: info.source,
                enabled: info.enabled,
                status: info.status,
                install_path,
                loaded_at: info.loaded_at,
            })
            .await
    }

    fn report_failure(&self, id: &str, err: &PluginError) {
        tracing::error!(plugin = %id, kind = err.kind(), error = %err, "plugin operation failed");
        metrics::counter!("ksp_plugin_loads_total", "outcome" => "failure").increment(1);
        self.events.publish(LifecycleEvent::PluginError {
            id: id.to_string(),
            detail: err.to_string(),
        });
    }

    /// Stops routing to the plugin, removes it and stops its instance.
    pub async fn unload(&self, id: &str) -> Result<()> {
        let _lock = self.locks.acquire(id).await;
        self.registry.set_status(id, RuntimeStatus::Unloading)?;
        let withdrawn = self.routes.withdraw(id);
        let entry = self.registry.deregister(id)?;
        entry.artifact.instance.shutdown().await;
        if let Err(err) = self.store.remove(id).await {
            tracing::warn!(plugin = %id, error = %err, "failed to remove installed record");
        }
        tracing::info!(plugin = %id, routes = withdrawn, "plugin unloaded");
        self.events
            .publish(LifecycleEvent::PluginUnloaded { id: id.to_string() });
        Ok(())
    }

    /// Rebuilds and relaunches from the recorded source. The running version
    /// keeps serving until the new one is ready; if anything fails it stays.
    pub async fn reload(&self, id: &str) -> Result<PluginInfo> {
        let _lock = self.locks.acquire(id).await;
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let result = self.reload_inner(id, current).await;
        match &result {
            Ok(info) => {
                metrics::counter!("ksp_plugin_loads_total", "outcome" => "reloaded").increment(1);
                self.events.publish(LifecycleEvent::PluginLoaded {
                    id: info.id.clone(),
                    version: info.version.clone(),
                });
            }
            Err(err) => self.report_failure(id, err),
        }
        result
    }

    async fn reload_inner(&self, id: &str, current: PluginInfo) -> Result<PluginInfo> {
        let mut subject = id.to_string();
        let prepared = self.prepare(&current.source, &mut subject, true).await?;
        if prepared.manifest.id != id {
            return Err(PluginError::InvalidSource(format!(
                "source for `{id}` now declares id `{}`",
                prepared.manifest.id
            )));
        }

        let loaded = self.loader.load(&prepared.artifact, &prepared.manifest).await?;
        let version = prepared.manifest.version.clone();
        let manifest = Arc::new(prepared.manifest);
        let mounted = match self.routes.replace(&manifest) {
            Ok(mounted) => mounted,
            Err(err) => {
                loaded.instance.shutdown().await;
                return Err(err);
            }
        };

        let mut entry = RegistryEntry::new(manifest, loaded.clone(), current.source);
        mark_ready(&mut entry.health);
        entry.enabled = current.enabled;
        entry.routes = mounted;
        entry.status = RuntimeStatus::Active;
        let previous = match self.registry.replace(entry) {
            Ok(previous) => previous,
            Err(err) => {
                // Unloaded while we were building.
                self.routes.withdraw(id);
                loaded.instance.shutdown().await;
                return Err(err);
            }
        };
        previous.artifact.instance.shutdown().await;
        tracing::info!(
            plugin = %id,
            from = %previous.manifest.version,
            to = %version,
            "plugin reloaded"
        );
        if let Err(err) = self.persist(id).await {
            tracing::warn!(plugin = %id, error = %err, "failed to persist reloaded plugin");
        }
        self.registry
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub async fn enable(&self, id: &str) -> Result<PluginInfo> {
        let _lock = self.locks.acquire(id).await;
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<PluginInfo> {
        let _lock = self.locks.acquire(id).await;
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<PluginInfo> {
        self.registry.set_enabled(id, enabled)?;
        tracing::info!(plugin = %id, enabled, "plugin routing toggled");
        if let Err(err) = self.persist(id).await {
            tracing::warn!(plugin = %id, error = %err, "failed to persist enabled flag");
        }
        self.registry
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.registry.list()
    }

    pub fn status(&self, id: &str) -> Result<PluginInfo> {
        self.registry
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.health.summary()
    }

    /// Probe history for one plugin.
    pub fn health(&self, id: &str) -> Result<HealthRecord> {
        self.status(id).map(|info| info.health)
    }

    pub fn metrics(&self) -> RegistryMetrics {
        self.registry.metrics()
    }

    pub fn clear_errors(&self, id: &str) -> Result<PluginInfo> {
        self.registry.clear_errors(id)?;
        self.status(id)
    }

    /// Counts a request dispatched to `id`, keeping the error when it failed.
    pub fn record_dispatch(&self, id: &str, error: Option<&str>) {
        self.registry.record_request(id);
        metrics::counter!("ksp_plugin_requests_total", "plugin" => id.to_string()).increment(1);
        if let Some(message) = error {
            self.registry.record_error(id, "dispatch", message);
            metrics::counter!("ksp_plugin_errors_total", "plugin" => id.to_string()).increment(1);
        }
    }

    pub async fn clear_build_cache(&self) -> Result<usize> {
        self.builder.clear_cache().await
    }

    pub fn build_cache_info(&self) -> CacheInfo {
        self.builder.cache_info()
    }

    /// Runs the static artifact checks without launching anything.
    pub async fn validate(&self, artifact: &Path, manifest: &Path) -> Result<ValidationReport> {
        let manifest = read_manifest(manifest).await?;
        let verified = self.loader.verify(artifact, &manifest).await?;
        Ok(ValidationReport {
            id: manifest.id,
            version: manifest.version,
            artifact: verified.path,
            checksum: verified.checksum,
            size: verified.size,
            routes: manifest.routes.len(),
        })
    }

    /// Resolves an inbound request to its plugin and handler.
    pub fn route(&self, method: &Method, path: &str) -> Option<(Resolution, DispatchTarget)> {
        let resolution = self.routes.resolve(method, path)?;
        let target = self.registry.dispatch_target(&resolution.plugin_id)?;
        Some((resolution, target))
    }

    /// Reloads plugins recorded in the metadata store from their installed
    /// copies. Records whose dependencies load later are retried until no
    /// further progress is made.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let mut pending = self.store.list().await?;
        let mut report = RestoreReport::default();
        loop {
            let mut progressed = false;
            let mut deferred = Vec::new();
            for record in pending {
                if self.registry.contains(&record.id) {
                    continue;
                }
                match self.restore_one(&record).await {
                    Ok(()) => {
                        progressed = true;
                        report.restored.push(record.id.clone());
                    }
                    Err(PluginError::DependencyUnsatisfied { .. }) => deferred.push(record),
                    Err(err) => {
                        self.report_failure(&record.id, &err);
                        self.mark_failed(&record).await;
                        report.failed.push((record.id.clone(), err.to_string()));
                    }
                }
            }
            if deferred.is_empty() || !progressed {
                for record in deferred {
                    let err = PluginError::DependencyUnsatisfied {
                        id: record.id.clone(),
                        dependency: String::from("*"),
                        requirement: String::from("*"),
                        reason: "dependencies could not be restored".into(),
                    };
                    self.report_failure(&record.id, &err);
                    self.mark_failed(&record).await;
                    report.failed.push((record.id, err.to_string()));
                }
                break;
            }
            pending = deferred;
        }
        tracing::info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "installed plugins restored"
        );
        Ok(report)
    }

    /// Keeps the record so a later start retries it, flagged as failed.
    async fn mark_failed(&self, record: &InstalledRecord) {
        let failed = InstalledRecord {
            status: RuntimeStatus::Failed,
            ..record.clone()
        };
        if let Err(err) = self.store.upsert(failed).await {
            tracing::warn!(plugin = %record.id, error = %err, "failed to record restore failure");
        }
    }

    async fn restore_one(&self, record: &InstalledRecord) -> Result<()> {
        let _lock = self.locks.acquire(&record.id).await;
        let (manifest, artifact) = match &record.source {
            PluginSource::Artifact { artifact, manifest } => {
                (read_manifest(manifest).await?, artifact.clone())
            }
            _ => {
                let dir = self.settings.root.join(&record.id);
                let manifest = read_manifest(&dir.join(MANIFEST_FILE)).await?;
                let artifact = PathBuf::from(&manifest.id).join(manifest.entry_name());
                (manifest, artifact)
            }
        };
        self.admit(&manifest, false)?;
        let info = self.activate(manifest, &artifact, record.source.clone()).await?;
        if !record.enabled {
            self.set_enabled(&info.id, false).await?;
        }
        self.events.publish(LifecycleEvent::PluginLoaded {
            id: info.id,
            version: info.version,
        });
        Ok(())
    }

    /// Loads every `plugins.autoload` source that is not already running.
    /// Local sources whose id is registered (typically by `restore`) are
    /// reported with their current state instead of being loaded again.
    pub async fn autoload(&self, sources: &[String]) -> Vec<(String, Result<PluginInfo>)> {
        let mut results = Vec::new();
        for raw in sources {
            let source = PluginSource::parse(raw);
            if let Some(info) = self.running_from(&source).await {
                tracing::debug!(plugin = %info.id, source = %raw, "autoload skipped; already running");
                results.push((raw.clone(), Ok(info)));
                continue;
            }
            let result = self.load_from_source(source).await;
            if let Err(PluginError::AlreadyRegistered(id)) = &result {
                tracing::debug!(plugin = %id, "autoload skipped; already running");
            }
            results.push((raw.clone(), result));
        }
        results
    }

    /// The registered plugin a local source describes, if any. Git sources
    /// are not fetched just to find out.
    async fn running_from(&self, source: &PluginSource) -> Option<PluginInfo> {
        let manifest_path = match source {
            PluginSource::Directory { path } => path.join(MANIFEST_FILE),
            PluginSource::Artifact { manifest, .. } => manifest.clone(),
            PluginSource::Git { .. } => return None,
        };
        let manifest = read_manifest(&manifest_path).await.ok()?;
        self.registry.get(&manifest.id)
    }

    /// Stops every running plugin. Installed records are kept so the next
    /// start can restore them.
    pub async fn shutdown(&self) {
        for info in self.registry.list() {
            let _ = self.registry.set_status(&info.id, RuntimeStatus::Unloading);
            self.routes.withdraw(&info.id);
            if let Ok(entry) = self.registry.deregister(&info.id) {
                entry.artifact.instance.shutdown().await;
            }
        }
        tracing::info!("all plugins stopped");
    }
}

/// A successful launch already proved the plugin answers its health probe.
fn mark_ready(record: &mut HealthRecord) {
    record.status = HealthStatus::Healthy;
    record.last_checked = Some(chrono::Utc::now());
    record.consecutive_successes = 1;
}

async fn read_manifest(path: &Path) -> Result<Manifest> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(PluginError::InvalidSource(format!(
                "manifest {} not found",
                path.display()
            )))
        }
        Err(err) => return Err(err.into()),
    };
    Ok(parse_manifest(&bytes)?)
}
