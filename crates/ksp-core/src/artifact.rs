use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use ksp_plugin_sdk::Manifest;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncReadExt, time::timeout};

use crate::{
    error::{PluginError, Result},
    host::{PluginHost, PluginInstance},
};

const READ_CHUNK: usize = 64 * 1024;

/// An artifact that passed every static check and may be launched.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedArtifact {
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
}

/// A launched artifact.
#[derive(Clone)]
pub struct LoadedArtifact {
    pub instance: Arc<dyn PluginInstance>,
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
}

/// Validates plugin executables and hands them to the [`PluginHost`].
pub struct ArtifactLoader {
    root: PathBuf,
    max_bytes: u64,
    load_timeout: Duration,
    host: Arc<dyn PluginHost>,
}

impl ArtifactLoader {
    pub fn new(
        root: impl Into<PathBuf>,
        max_bytes: u64,
        load_timeout: Duration,
        host: Arc<dyn PluginHost>,
    ) -> Self {
        Self {
            root: root.into(),
            max_bytes,
            load_timeout,
            host,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path, size, checksum and format checks. Nothing is executed.
    pub async fn verify(&self, path: &Path, manifest: &Manifest) -> Result<VerifiedArtifact> {
        let path = resolve_within(&self.root, path)?;

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(PluginError::ArtifactNotFound(path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PluginError::ArtifactNotFound(path))
            }
            Err(err) => return Err(err.into()),
        };
        if metadata.len() > self.max_bytes {
            return Err(PluginError::ArtifactTooLarge {
                size: metadata.len(),
                limit: self.max_bytes,
            });
        }

        let (checksum, header) = digest_file(&path).await?;
        if let Some(expected) = &manifest.security.checksum {
            if !expected.eq_ignore_ascii_case(&checksum) {
                return Err(PluginError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }
        if !has_native_magic(&header) {
            return Err(PluginError::InvalidArtifactFormat(path));
        }

        Ok(VerifiedArtifact {
            path,
            checksum,
            size: metadata.len(),
        })
    }

    /// Verifies and launches the artifact. Launch failures, including a
    /// plugin that never becomes ready, surface as `LoadFailed`.
    pub async fn load(&self, path: &Path, manifest: &Manifest) -> Result<LoadedArtifact> {
        let verified = self.verify(path, manifest).await?;
        let launch = self.host.launch(&verified, manifest);
        let instance = match timeout(self.load_timeout, launch).await {
            Ok(Ok(instance)) => instance,
            Ok(Err(err @ PluginError::LoadFailed { .. })) => return Err(err),
            Ok(Err(err)) => return Err(PluginError::load_failed(&manifest.id, err)),
            Err(_) => {
                return Err(PluginError::load_failed(
                    &manifest.id,
                    format!("not ready within {:?}", self.load_timeout),
                ))
            }
        };
        tracing::info!(
            plugin = %manifest.id,
            artifact = %verified.path.display(),
            checksum = %verified.checksum,
            size = verified.size,
            instance = %instance.describe(),
            "artifact loaded"
        );
        Ok(LoadedArtifact {
            instance,
            path: verified.path,
            checksum: verified.checksum,
            size: verified.size,
        })
    }
}

/// Joins relative paths onto `root` and rejects anything that ends up
/// outside it, following symlinks when the target exists.
pub fn resolve_within(root: &Path, path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let normalized = normalize(&joined);
    let root_normalized = normalize(root);
    if !normalized.starts_with(&root_normalized) {
        return Err(PluginError::PathEscape(path.to_path_buf()));
    }

    if let Ok(canonical) = normalized.canonicalize() {
        let canonical_root = root
            .canonicalize()
            .unwrap_or_else(|_| root_normalized.clone());
        if !canonical.starts_with(&canonical_root) {
            return Err(PluginError::PathEscape(path.to_path_buf()));
        }
    }
    Ok(normalized)
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

/// Streams the file through sha256, returning the hex digest and the first
/// bytes for the format check.
pub async fn digest_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut header = Vec::with_capacity(4);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        if header.len() < 4 {
            let take = (4 - header.len()).min(read);
            header.extend_from_slice(&buf[..take]);
        }
        hasher.update(&buf[..read]);
    }
    Ok((hex::encode(hasher.finalize()), header))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(target_os = "linux")]
fn has_native_magic(header: &[u8]) -> bool {
    header.starts_with(b"\x7fELF")
}

#[cfg(target_os = "macos")]
fn has_native_magic(header: &[u8]) -> bool {
    const MAGICS: [[u8; 4]; 4] = [
        [0xcf, 0xfa, 0xed, 0xfe],
        [0xce, 0xfa, 0xed, 0xfe],
        [0xca, 0xfe, 0xba, 0xbe],
        [0xbe, 0xba, 0xfe, 0xca],
    ];
    MAGICS.iter().any(|magic| header.starts_with(magic))
}

#[cfg(windows)]
fn has_native_magic(header: &[u8]) -> bool {
    header.starts_with(b"MZ")
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn has_native_magic(header: &[u8]) -> bool {
    header.starts_with(b"\x7fELF")
}

/// Magic bytes of the host executable format, for tests and fixtures.
pub const fn native_magic() -> &'static [u8] {
    if cfg!(target_os = "macos") {
        &[0xcf, 0xfa, 0xed, 0xfe]
    } else if cfg!(windows) {
        b"MZ"
    } else {
        b"\x7fELF"
    }
}
