use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{process::Command, time::timeout};

use crate::error::{PluginError, Result};

/// Where a plugin came from; recorded so it can be reloaded or restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PluginSource {
    Directory {
        path: PathBuf,
    },
    Git {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    Artifact {
        artifact: PathBuf,
        manifest: PathBuf,
    },
}

impl PluginSource {
    /// Interprets an operator-supplied string: git URLs (optionally suffixed
    /// with `@<ref>`) or a local source directory.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if !looks_like_git(raw) {
            return Self::Directory {
                path: PathBuf::from(raw),
            };
        }
        match raw.rsplit_once('@') {
            Some((url, reference))
                if !reference.is_empty()
                    && !reference.contains(['/', ':'])
                    && looks_like_git(url) =>
            {
                Self::Git {
                    url: url.to_string(),
                    reference: Some(reference.to_string()),
                }
            }
            _ => Self::Git {
                url: raw.to_string(),
                reference: None,
            },
        }
    }

    pub fn install_method(&self) -> &'static str {
        match self {
            Self::Directory { .. } => "directory",
            Self::Git { .. } => "git",
            Self::Artifact { .. } => "artifact",
        }
    }
}

impl fmt::Display for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory { path } => write!(f, "{}", path.display()),
            Self::Git {
                url,
                reference: Some(reference),
            } => write!(f, "{url}@{reference}"),
            Self::Git { url, .. } => f.write_str(url),
            Self::Artifact { artifact, .. } => write!(f, "{}", artifact.display()),
        }
    }
}

fn looks_like_git(raw: &str) -> bool {
    ["https://", "http://", "ssh://", "git://", "file://", "git@"]
        .iter()
        .any(|scheme| raw.starts_with(scheme))
        || raw.ends_with(".git")
}

/// True when `allowed` is empty or `url` names one of its prefixes or a path
/// beneath it. Prefixes match on whole path segments.
pub fn repo_allowed(url: &str, allowed: &[String]) -> bool {
    allowed.is_empty()
        || allowed.iter().any(|prefix| {
            let bare = prefix.trim_end_matches('/');
            !bare.is_empty()
                && (url == bare
                    || url
                        .strip_prefix(bare)
                        .is_some_and(|rest| rest.starts_with('/')))
        })
}

/// Retrieves a remote source tree into a local directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str, reference: Option<&str>, dest: &Path) -> Result<()>;
}

/// Shallow `git clone`.
pub struct GitFetcher {
    program: String,
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self::with_program("git", timeout)
    }

    pub fn with_program(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, url: &str, reference: Option<&str>, dest: &Path) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.args(["clone", "--depth", "1"]);
        if let Some(reference) = reference {
            command.args(["--branch", reference]);
        }
        command
            .arg("--")
            .arg(url)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(url, reference, dest = %dest.display(), "fetching plugin source");
        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(PluginError::FetchFailed {
                    url: url.to_string(),
                    output: format!("failed to run {}: {err}", self.program),
                })
            }
            Err(_) => {
                return Err(PluginError::Timeout {
                    stage: "fetch",
                    after: self.timeout,
                })
            }
        };
        if !output.status.success() {
            return Err(PluginError::FetchFailed {
                url: url.to_string(),
                output: combined_output(&output),
            });
        }
        Ok(())
    }
}

pub(crate) fn combined_output(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !text.is_empty() && !stderr.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&stderr);
    text
}
