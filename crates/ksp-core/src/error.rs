use std::{path::PathBuf, time::Duration};

use http::StatusCode;
use ksp_plugin_sdk::ManifestError;
use thiserror::Error;

/// Every failure a plugin lifecycle operation can report.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid manifest: {0}")]
    Validation(#[from] ManifestError),

    #[error("path `{}` escapes the plugins root", .0.display())]
    PathEscape(PathBuf),

    #[error("artifact `{}` not found", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("artifact is {size} bytes, limit is {limit}")]
    ArtifactTooLarge { size: u64, limit: u64 },

    #[error("`{}` is not a loadable executable for this platform", .0.display())]
    InvalidArtifactFormat(PathBuf),

    #[error("checksum mismatch: manifest declares {expected}, artifact is {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid plugin source: {0}")]
    InvalidSource(String),

    #[error("source `{0}` is not in the allowed repository list")]
    SourceNotAllowed(String),

    #[error("fetching `{url}` failed:\n{output}")]
    FetchFailed { url: String, output: String },

    #[error("build of `{id}` failed:\n{output}")]
    BuildFailed { id: String, output: String },

    #[error("plugin `{id}` failed to load: {reason}")]
    LoadFailed { id: String, reason: String },

    #[error("plugin `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("plugin `{0}` not found")]
    NotFound(String),

    #[error("a build for `{0}` is already running")]
    BuildInProgress(String),

    #[error("route `{method} {path}` is already served by plugin `{owner}`")]
    RouteConflict {
        method: String,
        path: String,
        owner: String,
    },

    #[error("plugin `{id}` requires `{dependency} {requirement}`: {reason}")]
    DependencyUnsatisfied {
        id: String,
        dependency: String,
        requirement: String,
        reason: String,
    },

    #[error("plugin `{id}` requests permission `{permission}` which is not allowed")]
    PermissionDenied { id: String, permission: String },

    #[error("health probe for `{0}` timed out")]
    ProbeTimeout(String),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Store(String),
}

impl PluginError {
    pub fn load_failed(id: &str, reason: impl ToString) -> Self {
        Self::LoadFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// HTTP status the admin surface answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRegistered(_) | Self::BuildInProgress(_) | Self::RouteConflict { .. } => {
                StatusCode::CONFLICT
            }
            Self::PathEscape(_) | Self::SourceNotAllowed(_) | Self::PermissionDenied { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::ArtifactTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Validation(_)
            | Self::InvalidArtifactFormat(_)
            | Self::ChecksumMismatch { .. }
            | Self::InvalidSource(_)
            | Self::BuildFailed { .. }
            | Self::DependencyUnsatisfied { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FetchFailed { .. } | Self::LoadFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::ProbeTimeout(_) | Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Io(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::PathEscape(_) => "path_escape",
            Self::ArtifactNotFound(_) => "artifact_not_found",
            Self::ArtifactTooLarge { .. } => "artifact_too_large",
            Self::InvalidArtifactFormat(_) => "invalid_artifact_format",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::InvalidSource(_) => "invalid_source",
            Self::SourceNotAllowed(_) => "source_not_allowed",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::BuildFailed { .. } => "build_failed",
            Self::LoadFailed { .. } => "load_failed",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::NotFound(_) => "not_found",
            Self::BuildInProgress(_) => "build_in_progress",
            Self::RouteConflict { .. } => "route_conflict",
            Self::DependencyUnsatisfied { .. } => "dependency_unsatisfied",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::ProbeTimeout(_) => "probe_timeout",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Store(_) => "store",
        }
    }
}

pub type Result<T, E = PluginError> = std::result::Result<T, E>;
