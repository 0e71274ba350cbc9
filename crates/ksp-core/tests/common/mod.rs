#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Response, StatusCode};
use ksp_core::{
    artifact::{native_magic, VerifiedArtifact},
    config::{self, Config},
    host::{HttpRequest, HttpResponse, PluginHost, PluginInstance},
    PluginError, PluginManager,
};
use ksp_plugin_sdk::{Manifest, RouteDecl, MANIFEST_FILE};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Writes the native magic into `out/{entry}` so the loader accepts it.
pub const BUILD_SCRIPT: &str = "mkdir -p out && printf '\\177ELF' > out/{entry}";

pub struct FakeInstance {
    pub id: String,
    pub version: String,
    pub failing: AtomicBool,
    pub stopped: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl PluginInstance for FakeInstance {
    async fn probe(&self) -> Result<(), String> {
        if self.failing.load(Ordering::SeqCst) {
            Err("connection refused".into())
        } else {
            Ok(())
        }
    }

    async fn dispatch(&self, handler: &str, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match handler {
            "explode" => anyhow::bail!("handler crashed"),
            "slow" => tokio::time::sleep(std::time::Duration::from_secs(5)).await,
            _ => {}
        }
        let body = format!(
            "{}@{} {handler} {}",
            self.id,
            self.version,
            request.uri()
        );
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::from(body))?)
    }

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        format!("fake:{}", self.id)
    }
}

/// Launches [`FakeInstance`]s and remembers the latest one per plugin.
#[derive(Default)]
pub struct FakeHost {
    instances: Mutex<HashMap<String, Arc<FakeInstance>>>,
    refuse: Mutex<Vec<String>>,
    launches: AtomicUsize,
}

impl FakeHost {
    pub fn instance(&self, id: &str) -> Arc<FakeInstance> {
        self.instances.lock()[id].clone()
    }

    pub fn refuse(&self, id: &str) {
        self.refuse.lock().push(id.to_string());
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginHost for FakeHost {
    async fn launch(
        &self,
        _artifact: &VerifiedArtifact,
        manifest: &Manifest,
    ) -> Result<Arc<dyn PluginInstance>, PluginError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.refuse.lock().contains(&manifest.id) {
            return Err(PluginError::load_failed(&manifest.id, "exited with status 1"));
        }
        let instance = Arc::new(FakeInstance {
            id: manifest.id.clone(),
            version: manifest.version.clone(),
            failing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        self.instances
            .lock()
            .insert(manifest.id.clone(), instance.clone());
        Ok(instance)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub host: Arc<FakeHost>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.listeners = vec![config::Listener {
            name: "main".into(),
            bind: "127.0.0.1:0".into(),
            ..Default::default()
        }];
        config.plugins.root = dir.path().join("plugins");
        config.plugins.cache_dir = dir.path().join("cache");
        config.build = config::Build {
            program: "sh".into(),
            args: vec!["-c".into(), BUILD_SCRIPT.into()],
            artifact: "out/{entry}".into(),
            ..Default::default()
        };
        tweak(&mut config);
        Self {
            dir,
            config,
            host: Arc::new(FakeHost::default()),
        }
    }

    pub fn manager(&self) -> PluginManager {
        PluginManager::new(&self.config, self.host.clone()).unwrap()
    }

    pub fn plugins_root(&self) -> PathBuf {
        self.config.plugins.root.canonicalize().unwrap()
    }

    /// Creates a buildable source tree under `src/<id>`.
    pub fn source(&self, manifest: &Manifest) -> PathBuf {
        let dir = self.dir.path().join("src").join(&manifest.id);
        write_source(&dir, manifest);
        dir
    }
}

pub fn write_source(dir: &Path, manifest: &Manifest) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(MANIFEST_FILE), manifest.to_toml().unwrap()).unwrap();
    std::fs::write(
        dir.join("Cargo.toml"),
        format!("[package]\nname = \"{}\"\nversion = \"{}\"\n", manifest.id, manifest.version),
    )
    .unwrap();
}

pub fn manifest(id: &str, version: &str) -> Manifest {
    Manifest {
        id: id.into(),
        name: id.into(),
        version: version.into(),
        routes: vec![
            RouteDecl::new("GET", "/stats", "stats"),
            RouteDecl::new("GET", "/items/:item", "item"),
            RouteDecl::new("POST", "/boom", "explode"),
        ],
        ..Default::default()
    }
}

/// Writes an executable-looking file of `len` bytes.
pub fn write_artifact(path: &Path, len: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut bytes = native_magic().to_vec();
    bytes.resize(len.max(bytes.len()), 0);
    std::fs::write(path, bytes).unwrap();
}
