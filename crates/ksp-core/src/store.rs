use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};

use crate::{
    error::{PluginError, Result},
    fetch::PluginSource,
    registry::RuntimeStatus,
};

pub const INSTALLED_FILE: &str = "installed.json";

/// Persisted metadata for one installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub id: String,
    pub version: String,
    pub install_method: String,
    pub source: PluginSource,
    pub enabled: bool,
    pub status: RuntimeStatus,
    pub install_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstalledFile {
    #[serde(default)]
    plugins: BTreeMap<String, InstalledRecord>,
}

/// Where installed-plugin records live.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert(&self, record: InstalledRecord) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<InstalledRecord>>;
}

/// `installed.json` under the plugins root.
pub struct JsonStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(plugins_root: &Path) -> Self {
        Self::at(plugins_root.join(INSTALLED_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<InstalledFile> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                PluginError::Store(format!("{} is corrupt: {err}", self.path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(InstalledFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, file: &InstalledFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(file).map_err(|err| PluginError::Store(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonStore {
    async fn upsert(&self, record: InstalledRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        file.plugins.insert(record.id.clone(), record);
        self.write(&file).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        if file.plugins.remove(id).is_some() {
            self.write(&file).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstalledRecord>> {
        Ok(self.read().await?.plugins.into_values().collect())
    }
}

/// Reads `installed.json` without a running host.
pub fn read_installed(path: &Path) -> anyhow::Result<Vec<InstalledRecord>> {
    use anyhow::Context;

    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file: InstalledFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(file.plugins.into_values().collect())
}
