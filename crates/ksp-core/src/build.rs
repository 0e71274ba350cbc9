use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use chrono::{DateTime, Utc};
use ksp_plugin_sdk::{Manifest, MANIFEST_FILE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs, process::Command, time::timeout};

use crate::{
    config,
    error::{PluginError, Result},
    fetch::combined_output,
};

pub const INDEX_FILE: &str = "index.json";
const SKIPPED_DIRS: [&str; 2] = ["target", ".git"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildCacheEntry {
    pub id: String,
    pub version: String,
    pub source_hash: String,
    pub artifact_path: PathBuf,
    pub built_at: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    entries: BTreeMap<String, BuildCacheEntry>,
}

#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    pub path: PathBuf,
    pub source_hash: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cache_dir: PathBuf,
    pub entries: Vec<BuildCacheEntry>,
    pub total_bytes: u64,
}

/// Compiles plugin source trees into cached executables.
pub struct BuildPipeline {
    settings: config::Build,
    cache_dir: PathBuf,
    index: Mutex<CacheIndex>,
    in_flight: Mutex<HashSet<String>>,
    persist: tokio::sync::Mutex<()>,
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Result<Self> {
        if !set.lock().insert(id.to_string()) {
            return Err(PluginError::BuildInProgress(id.to_string()));
        }
        Ok(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl BuildPipeline {
    /// Opens the cache under `cache_dir`, dropping index entries whose
    /// artifact has disappeared.
    pub fn open(settings: config::Build, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let index_path = cache_dir.join(INDEX_FILE);
        let mut index = match std::fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice::<CacheIndex>(&bytes).unwrap_or_else(|err| {
                tracing::warn!(path = %index_path.display(), error = %err, "ignoring corrupt build cache index");
                CacheIndex::default()
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => CacheIndex::default(),
            Err(err) => return Err(err.into()),
        };
        index.entries.retain(|_, entry| entry.artifact_path.is_file());
        Ok(Self {
            settings,
            cache_dir,
            index: Mutex::new(index),
            in_flight: Mutex::new(HashSet::new()),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &config::Build {
        &self.settings
    }

    pub fn is_building(&self, id: &str) -> bool {
        self.in_flight.lock().contains(id)
    }

    /// Builds `source_dir`, or returns the cached artifact when the same id,
    /// version and source contents were built before.
    pub async fn build(&self, source_dir: &Path, manifest: &Manifest) -> Result<BuiltArtifact> {
        check_source(source_dir, &self.settings.entry_file)?;
        let id = manifest.id.as_str();
        let _guard = InFlightGuard::acquire(&self.in_flight, id)?;

        let source_hash = {
            let dir = source_dir.to_path_buf();
            tokio::task::spawn_blocking(move || hash_tree(&dir))
                .await
                .map_err(io::Error::other)??
        };

        if let Some(hit) = self.lookup(id, &manifest.version, &source_hash) {
            tracing::debug!(plugin = %id, hash = %&source_hash[..12], "build cache hit");
            metrics::counter!("ksp_builds_total", "outcome" => "cached").increment(1);
            return Ok(BuiltArtifact {
                path: hit.artifact_path,
                source_hash,
                cached: true,
            });
        }

        let started = Instant::now();
        let result = self.compile(source_dir, manifest, &source_hash).await;
        let outcome = if result.is_ok() { "built" } else { "failed" };
        metrics::counter!("ksp_builds_total", "outcome" => outcome).increment(1);
        let path = result?;
        tracing::info!(
            plugin = %id,
            version = %manifest.version,
            duration_ms = started.elapsed().as_millis() as u64,
            artifact = %path.display(),
            "plugin built"
        );
        Ok(BuiltArtifact {
            path,
            source_hash,
            cached: false,
        })
    }

    fn lookup(&self, id: &str, version: &str, source_hash: &str) -> Option<BuildCacheEntry> {
        self.index
            .lock()
            .entries
            .get(id)
            .filter(|entry| entry.version == version && entry.source_hash == source_hash)
            .filter(|entry| entry.artifact_path.is_file())
            .cloned()
    }

    async fn compile(&self, source_dir: &Path, manifest: &Manifest, source_hash: &str) -> Result<PathBuf> {
        let id = manifest.id.as_str();
        let entry = manifest.entry_name();
        let stage = tempfile::Builder::new().prefix("ksp-build-").tempdir()?;
        {
            let from = source_dir.to_path_buf();
            let to = stage.path().to_path_buf();
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(io::Error::other)??;
        }
        if let Some(sdk) = &self.settings.sdk_path {
            write_sdk_patch(stage.path(), sdk).await?;
        }

        let args: Vec<String> = self
            .settings
            .args
            .iter()
            .map(|arg| expand(arg, id, entry))
            .collect();
        let mut command = Command::new(&self.settings.program);
        command
            .args(&args)
            .current_dir(stage.path())
            .env("CARGO_TARGET_DIR", stage.path().join("target"))
            .env("CARGO_PROFILE_RELEASE_STRIP", "symbols")
            .env("CARGO_PROFILE_RELEASE_DEBUG", "false")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(plugin = %id, program = %self.settings.program, ?args, "building plugin");
        let output = match timeout(self.settings.timeout(), command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(PluginError::BuildFailed {
                    id: id.to_string(),
                    output: format!("failed to run {}: {err}", self.settings.program),
                })
            }
            Err(_) => {
                return Err(PluginError::Timeout {
                    stage: "build",
                    after: self.settings.timeout(),
                })
            }
        };
        let log = combined_output(&output);
        if !output.status.success() {
            return Err(PluginError::BuildFailed {
                id: id.to_string(),
                output: log,
            });
        }

        let produced = stage.path().join(expand(&self.settings.artifact, id, entry));
        if !produced.is_file() {
            return Err(PluginError::BuildFailed {
                id: id.to_string(),
                output: format!("{log}\nexpected artifact {} was not produced", produced.display()),
            });
        }

        let plugin_cache = self.cache_dir.join(id);
        let dest_dir = plugin_cache.join(&source_hash[..12]);
        fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join(entry);
        fs::copy(&produced, &dest).await?;
        let size = fs::metadata(&dest).await?.len();
        prune_siblings(&plugin_cache, &dest_dir).await?;

        self.index.lock().entries.insert(
            id.to_string(),
            BuildCacheEntry {
                id: id.to_string(),
                version: manifest.version.clone(),
                source_hash: source_hash.to_string(),
                artifact_path: dest.clone(),
                built_at: Utc::now(),
                size,
            },
        );
        self.persist_index().await?;
        Ok(dest)
    }

    async fn persist_index(&self) -> Result<()> {
        let _guard = self.persist.lock().await;
        let json = {
            let index = self.index.lock();
            serde_json::to_vec_pretty(&*index).map_err(|err| PluginError::Store(err.to_string()))?
        };
        fs::create_dir_all(&self.cache_dir).await?;
        let path = self.cache_dir.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub fn cache_info(&self) -> CacheInfo {
        let entries: Vec<BuildCacheEntry> = self.index.lock().entries.values().cloned().collect();
        let total_bytes = entries.iter().map(|entry| entry.size).sum();
        CacheInfo {
            cache_dir: self.cache_dir.clone(),
            entries,
            total_bytes,
        }
    }

    /// Deletes every cached artifact. Returns how many entries were dropped.
    pub async fn clear_cache(&self) -> Result<usize> {
        let removed: Vec<BuildCacheEntry> = {
            let mut index = self.index.lock();
            std::mem::take(&mut index.entries).into_values().collect()
        };
        for entry in &removed {
            let dir = self.cache_dir.join(&entry.id);
            if let Err(err) = fs::remove_dir_all(&dir).await {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        self.persist_index().await?;
        tracing::info!(entries = removed.len(), "build cache cleared");
        Ok(removed.len())
    }
}

/// A plugin source tree needs a manifest and the build entry file.
pub fn check_source(dir: &Path, entry_file: &str) -> Result<()> {
    if !dir.is_dir() {
        return Err(PluginError::InvalidSource(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    for required in [MANIFEST_FILE, entry_file] {
        if !dir.join(required).is_file() {
            return Err(PluginError::InvalidSource(format!(
                "{} has no {required}",
                dir.display()
            )));
        }
    }
    Ok(())
}

fn expand(template: &str, id: &str, entry: &str) -> String {
    template.replace("{id}", id).replace("{entry}", entry)
}

async fn write_sdk_patch(stage: &Path, sdk: &Path) -> Result<()> {
    let sdk = sdk.canonicalize().unwrap_or_else(|_| sdk.to_path_buf());
    let dir = stage.join(".cargo");
    fs::create_dir_all(&dir).await?;
    let patch = format!(
        "[patch.crates-io]\nksp-plugin-sdk = {{ path = {} }}\n",
        toml::Value::String(sdk.display().to_string())
    );
    fs::write(dir.join("config.toml"), patch).await?;
    Ok(())
}

async fn prune_siblings(plugin_cache: &Path, keep: &Path) -> Result<()> {
    let mut dir = fs::read_dir(plugin_cache).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path != keep && entry.file_type().await?.is_dir() {
            tracing::debug!(path = %path.display(), "removing stale build");
            fs::remove_dir_all(&path).await?;
        }
    }
    Ok(())
}

/// sha256 over every file's relative path and contents, in path order.
pub fn hash_tree(root: &Path) -> io::Result<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for relative in files {
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(root.join(&relative))?);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if SKIPPED_DIRS.iter().any(|skip| entry.file_name() == *skip) {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            if SKIPPED_DIRS.iter().any(|skip| entry.file_name() == *skip) {
                continue;
            }
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), target)?;
        } else if file_type.is_symlink() {
            tracing::warn!(
                path = %entry.path().display(),
                "symlink in plugin source is neither hashed nor staged"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(dir: &Path, id: &str, version: &str) -> Manifest {
        let manifest = Manifest {
            id: id.into(),
            name: id.into(),
            version: version.into(),
            ..Default::default()
        };
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest.to_toml().unwrap()).unwrap();
        std::fs::write(dir.join("Cargo.toml"), "[package]\n").unwrap();
        std::fs::write(dir.join("main.src"), format!("{id} {version}")).unwrap();
        manifest
    }

    fn shell_settings(script: &str) -> config::Build {
        config::Build {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            artifact: "out/{entry}".into(),
            ..Default::default()
        }
    }

    const OK_SCRIPT: &str = "mkdir -p out && printf '\\177ELF' > out/{entry}";

    #[test]
    fn source_without_manifest_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        assert!(matches!(
            check_source(dir.path(), "Cargo.toml"),
            Err(PluginError::InvalidSource(_))
        ));
    }

    #[test]
    fn tree_hash_ignores_build_output_and_tracks_edits() {
        let dir = tempfile::tempdir().unwrap();
        source(dir.path(), "demo", "1.0.0");
        let first = hash_tree(dir.path()).unwrap();

        std::fs::create_dir_all(dir.path().join("target/release")).unwrap();
        std::fs::write(dir.path().join("target/release/demo"), "bin").unwrap();
        assert_eq!(hash_tree(dir.path()).unwrap(), first);

        std::fs::write(dir.path().join("main.src"), "edited").unwrap();
        assert_ne!(hash_tree(dir.path()).unwrap(), first);
    }

    #[test]
    fn placeholders_expand() {
        assert_eq!(expand("target/release/{entry}", "demo", "demo-bin"), "target/release/demo-bin");
        assert_eq!(expand("--bin={id}", "demo", "x"), "--bin=demo");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builds_are_cached_by_source_contents() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        let pipeline = BuildPipeline::open(shell_settings(OK_SCRIPT), cache.path()).unwrap();

        let first = pipeline.build(src.path(), &manifest).await.unwrap();
        assert!(!first.cached);
        assert!(first.path.starts_with(cache.path().join("demo")));
        assert_eq!(std::fs::read(&first.path).unwrap(), b"\x7fELF");

        let second = pipeline.build(src.path(), &manifest).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.path, first.path);

        std::fs::write(src.path().join("main.src"), "changed").unwrap();
        let third = pipeline.build(src.path(), &manifest).await.unwrap();
        assert!(!third.cached);
        assert_ne!(third.path, first.path);
        assert!(!first.path.exists(), "stale build should be pruned");

        let info = pipeline.cache_info();
        assert_eq!(info.entries.len(), 1);
        assert_eq!(info.total_bytes, 4);

        let reopened = BuildPipeline::open(shell_settings(OK_SCRIPT), cache.path()).unwrap();
        assert_eq!(reopened.cache_info().entries, info.entries);
        assert_eq!(reopened.clear_cache().await.unwrap(), 1);
        assert!(reopened.cache_info().entries.is_empty());
        assert!(!third.path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_build_reports_tool_output() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        let pipeline = BuildPipeline::open(
            shell_settings("echo 'error[E0425]: cannot find value' >&2; exit 101"),
            cache.path(),
        )
        .unwrap();

        let (id, output) = match pipeline.build(src.path(), &manifest).await.unwrap_err() {
            PluginError::BuildFailed { id, output } => (id, output),
            other => panic!("expected BuildFailed, got {other:?}"),
        };
        assert_eq!(id, "demo");
        assert!(output.contains("E0425"), "{output}");
        assert!(pipeline.cache_info().entries.is_empty());
        assert!(!pipeline.is_building("demo"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_artifact_is_a_build_failure() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        let pipeline = BuildPipeline::open(shell_settings("true"), cache.path()).unwrap();
        let err = pipeline.build(src.path(), &manifest).await.unwrap_err();
        assert!(matches!(err, PluginError::BuildFailed { ref output, .. } if output.contains("not produced")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_builds_time_out() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        let mut settings = shell_settings("sleep 5");
        settings.timeout_secs = 1;
        let pipeline = BuildPipeline::open(settings, cache.path()).unwrap();
        let err = pipeline.build(src.path(), &manifest).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout { stage: "build", .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sdk_patch_is_written_into_the_stage() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        let mut settings = shell_settings(
            "grep -q 'ksp-plugin-sdk' .cargo/config.toml && mkdir -p out && printf '\\177ELF' > out/{entry}",
        );
        settings.sdk_path = Some(src.path().to_path_buf());
        let pipeline = BuildPipeline::open(settings, cache.path()).unwrap();
        pipeline.build(src.path(), &manifest).await.unwrap();
        assert!(!src.path().join(".cargo").exists(), "source tree must stay untouched");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn checked_in_sdk_patch_is_replaced_in_the_stage() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        std::fs::create_dir_all(src.path().join(".cargo")).unwrap();
        std::fs::write(
            src.path().join(".cargo/config.toml"),
            "[patch.crates-io]\nksp-plugin-sdk = { path = \"../../crates/ksp-plugin-sdk\" }\n",
        )
        .unwrap();
        let mut settings = shell_settings(
            "! grep -q '\\.\\./\\.\\./crates' .cargo/config.toml && mkdir -p out && printf '\\177ELF' > out/{entry}",
        );
        settings.sdk_path = Some(cache.path().to_path_buf());
        let pipeline = BuildPipeline::open(settings, cache.path()).unwrap();
        pipeline.build(src.path(), &manifest).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_stay_out_of_the_stage_and_the_hash() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        let before = hash_tree(src.path()).unwrap();
        std::os::unix::fs::symlink("/etc/hostname", src.path().join("leak.src")).unwrap();
        assert_eq!(hash_tree(src.path()).unwrap(), before);

        let pipeline = BuildPipeline::open(
            shell_settings("[ ! -e leak.src ] && mkdir -p out && printf '\\177ELF' > out/{entry}"),
            cache.path(),
        )
        .unwrap();
        let built = pipeline.build(src.path(), &manifest).await.unwrap();
        assert_eq!(built.source_hash, before);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_builds_of_one_id_run_once() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let manifest = source(src.path(), "demo", "1.0.0");
        let pipeline = BuildPipeline::open(
            shell_settings("sleep 0.5 && mkdir -p out && printf '\\177ELF' > out/{entry}"),
            cache.path(),
        )
        .unwrap();

        let (a, b) = tokio::join!(
            pipeline.build(src.path(), &manifest),
            pipeline.build(src.path(), &manifest)
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(PluginError::BuildInProgress(id)) if id == "demo")));
    }
}
