use std::{
    collections::HashSet,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_PLUGIN_DIR: &str = "KSP_PLUGIN_DIR";
pub const ENV_CACHE_DIR: &str = "KSP_CACHE_DIR";

const MIB: u64 = 1024 * 1024;

/// Root configuration structure deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub admin: Admin,
    pub listeners: Vec<Listener>,
    pub plugins: Plugins,
    pub loader: Loader,
    pub build: Build,
    pub health: Health,
    pub routes: Routes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Admin {
    pub enabled: bool,
}

impl Default for Admin {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Listener {
    pub name: String,
    pub bind: String,
    pub tls: Option<Tls>,
    pub alpn: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tls {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Plugins {
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    /// Git URL prefixes plugins may be fetched from. Empty allows any.
    pub allowed_repos: Vec<String>,
    /// Permissions a manifest may request. Empty allows any.
    pub allowed_permissions: Vec<String>,
    /// Sources loaded on startup (directory paths or git URLs).
    pub autoload: Vec<String>,
    pub restore_on_start: bool,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            root: PathBuf::from("plugins"),
            cache_dir: PathBuf::from("plugins/.cache"),
            allowed_repos: Vec::new(),
            allowed_permissions: Vec::new(),
            autoload: Vec::new(),
            restore_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Loader {
    pub max_artifact_bytes: u64,
    pub load_timeout_secs: u64,
}

impl Default for Loader {
    fn default() -> Self {
        Self {
            max_artifact_bytes: 50 * MIB,
            load_timeout_secs: 10,
        }
    }
}

impl Loader {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Build {
    pub program: String,
    pub args: Vec<String>,
    /// Artifact path relative to the staging dir; `{id}` and `{entry}` expand.
    pub artifact: String,
    pub entry_file: String,
    /// Local checkout of `ksp-plugin-sdk` patched into every plugin build.
    pub sdk_path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for Build {
    fn default() -> Self {
        Self {
            program: "cargo".into(),
            args: vec!["build".into(), "--release".into()],
            artifact: "target/release/{entry}".into(),
            entry_file: "Cargo.toml".into(),
            sdk_path: None,
            timeout_secs: 600,
            fetch_timeout_secs: 120,
        }
    }
}

impl Build {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Health {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            healthy_threshold: 1,
            unhealthy_threshold: 3,
        }
    }
}

impl Health {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Reject,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Routes {
    /// Mount prefix for plugin routes; `{id}` expands to the plugin id.
    pub prefix: String,
    pub on_conflict: ConflictPolicy,
    pub request_timeout_secs: u64,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            prefix: "/api/plugins/{id}".into(),
            on_conflict: ConflictPolicy::Reject,
            request_timeout_secs: 30,
        }
    }
}

impl Routes {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            bail!("at least one listener is required");
        }
        let mut listener_names = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !listener_names.insert(listener.name.clone()) {
                bail!("duplicate listener name `{}`", listener.name);
            }
        }

        if self.plugins.root.as_os_str().is_empty() {
            bail!("plugins.root must not be empty");
        }
        if self.plugins.cache_dir.as_os_str().is_empty() {
            bail!("plugins.cache_dir must not be empty");
        }
        if self.loader.max_artifact_bytes == 0 {
            bail!("loader.max_artifact_bytes must be greater than zero");
        }
        if self.loader.load_timeout_secs == 0 {
            bail!("loader.load_timeout_secs must be greater than zero");
        }
        if self.build.program.trim().is_empty() {
            bail!("build.program must name the build tool (e.g. `cargo`)");
        }
        if self.build.artifact.trim().is_empty() {
            bail!("build.artifact must point at the built executable");
        }
        if self.build.timeout_secs == 0 || self.build.fetch_timeout_secs == 0 {
            bail!("build.timeout_secs and build.fetch_timeout_secs must be greater than zero");
        }
        if self.health.interval_secs == 0 || self.health.timeout_secs == 0 {
            bail!("health.interval_secs and health.timeout_secs must be greater than zero");
        }
        if self.health.healthy_threshold == 0 || self.health.unhealthy_threshold == 0 {
            bail!("health thresholds must be at least 1");
        }
        if !self.routes.prefix.starts_with('/') {
            bail!(
                "routes.prefix `{}` must start with '/'",
                self.routes.prefix
            );
        }
        if self.routes.prefix.starts_with("/admin") {
            bail!("routes.prefix must not shadow the /admin surface");
        }
        Ok(())
    }

    /// Applies `KSP_PLUGIN_DIR` / `KSP_CACHE_DIR` on top of the file values.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_PLUGIN_DIR).filter(|v| !v.is_empty()) {
            self.plugins.root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.plugins.cache_dir = PathBuf::from(dir);
        }
    }

    /// Returns parsed listeners with ready-to-bind socket addresses.
    pub fn resolved_listeners(&self) -> Result<Vec<ResolvedListener>> {
        self.listeners
            .iter()
            .map(ResolvedListener::try_from)
            .collect()
    }
}

/// Runtime representation of a listener with parsed socket/tls config.
#[derive(Debug, Clone)]
pub struct ResolvedListener {
    pub name: String,
    pub addr: SocketAddr,
    pub tls: Option<Tls>,
    pub alpn: Vec<String>,
}

impl TryFrom<&Listener> for ResolvedListener {
    type Error = anyhow::Error;

    fn try_from(listener: &Listener) -> Result<Self> {
        let addr = listener.parse_bind_addr()?;
        let alpn = listener
            .alpn
            .clone()
            .unwrap_or_else(|| vec!["http/1.1".into()]);
        Ok(Self {
            name: listener.name.clone(),
            addr,
            tls: listener.tls.clone(),
            alpn,
        })
    }
}

impl Listener {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("listener name must not be empty");
        }
        self.parse_bind_addr()
            .with_context(|| format!("invalid bind address for listener `{}`", self.name))?;
        if let Some(tls) = &self.tls {
            tls.validate()
                .with_context(|| format!("listener `{}`", self.name))?;
        }
        Ok(())
    }

    pub fn parse_bind_addr(&self) -> Result<SocketAddr> {
        if self.bind.starts_with(':') {
            let addr = format!("0.0.0.0{}", self.bind);
            Ok(SocketAddr::from_str(&addr)?)
        } else {
            Ok(SocketAddr::from_str(&self.bind)?)
        }
    }
}

impl Tls {
    pub fn validate(&self) -> Result<()> {
        if self.cert.trim().is_empty() || self.key.trim().is_empty() {
            bail!("tls cert and key paths must be provided");
        }
        Ok(())
    }
}
