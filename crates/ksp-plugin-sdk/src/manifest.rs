use std::{collections::HashSet, sync::OnceLock};

use regex::Regex;
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the descriptor every plugin source tree and install dir carries.
pub const MANIFEST_FILE: &str = "plugin.toml";
pub const DEFAULT_HEALTH_ENDPOINT: &str = "/healthz";

const SUPPORTED_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest is not valid TOML: {0}")]
    Parse(String),
    #[error("manifest could not be serialized: {0}")]
    Serialize(String),
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("invalid plugin id `{0}` (expected ^[a-z][a-z0-9-]{{0,49}}$)")]
    InvalidIdentifier(String),
    #[error("invalid version `{0}` (only alphanumerics, `.` and `-` are allowed)")]
    InvalidVersion(String),
    #[error("duplicate route `{method} {path}`")]
    DuplicateRoute { method: String, path: String },
    #[error("route {index}: {reason}")]
    InvalidRoute { index: usize, reason: String },
    #[error("dependency `{id}`: {reason}")]
    InvalidDependency { id: String, reason: String },
    #[error("invalid permission `{0}`")]
    InvalidPermission(String),
}

/// Declarative description of a plugin, read from `plugin.toml`.
///
/// Scalar fields come before tables so the struct serializes back into
/// valid TOML.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// Artifact file name produced by the build. Defaults to the id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "toml::Table::is_empty")]
    pub config: toml::Table,
    #[serde(skip_serializing_if = "HealthDecl::is_default")]
    pub health: HealthDecl,
    #[serde(skip_serializing_if = "SecurityDecl::is_default")]
    pub security: SecurityDecl,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteDecl>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecl {
    pub path: String,
    pub method: String,
    pub handler: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Checked by the host before the request reaches the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<RequestValidation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl RouteDecl {
    pub fn new(method: &str, path: &str, handler: &str) -> Self {
        Self {
            path: path.to_string(),
            method: method.to_string(),
            handler: handler.to_string(),
            description: String::new(),
            validation: None,
            rate_limit: None,
        }
    }
}

/// Request shape a route accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestValidation {
    /// Accepted `Content-Type` fragments; any one must appear in the header.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub content_type: Vec<String>,
    /// Top-level fields the JSON body must carry.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

/// At most `requests` per client address within a sliding `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_window_ms() -> u64 {
    60_000
}

/// Another plugin that must be loaded first, with a semver requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    #[serde(default = "any_version")]
    pub version: String,
}

impl Dependency {
    pub fn requirement(&self) -> Result<VersionReq, semver::Error> {
        VersionReq::parse(&self.version)
    }
}

fn any_version() -> String {
    "*".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthDecl {
    pub endpoint: String,
}

impl Default for HealthDecl {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HEALTH_ENDPOINT.into(),
        }
    }
}

impl HealthDecl {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Security flags declared by the author. Only `checksum` is enforced by the
/// host; the remaining flags describe the intended boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityDecl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub sandboxed: bool,
    pub network_access: bool,
    pub filesystem_access: bool,
}

impl SecurityDecl {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Parses and validates a manifest. Pure: no filesystem access.
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest, ManifestError> {
    let text = std::str::from_utf8(bytes).map_err(|err| ManifestError::Parse(err.to_string()))?;
    let manifest: Manifest =
        toml::from_str(text).map_err(|err| ManifestError::Parse(err.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn is_valid_id(id: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{0,49}$").expect("static regex"))
        .is_match(id)
}

fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

fn is_valid_handler(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("static regex"))
        .is_match(name)
}

impl Manifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::MissingField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingField("name"));
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::MissingField("version"));
        }
        if !is_valid_id(&self.id) {
            return Err(ManifestError::InvalidIdentifier(self.id.clone()));
        }
        if !is_valid_version(&self.version) {
            return Err(ManifestError::InvalidVersion(self.version.clone()));
        }
        self.validate_routes()?;
        self.validate_dependencies()?;

        let mut seen = HashSet::new();
        for permission in &self.permissions {
            if permission.trim().is_empty()
                || permission.chars().any(char::is_whitespace)
                || !seen.insert(permission.as_str())
            {
                return Err(ManifestError::InvalidPermission(permission.clone()));
            }
        }
        Ok(())
    }

    fn validate_routes(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            let invalid = |reason: String| ManifestError::InvalidRoute { index, reason };
            if !route.path.starts_with('/') {
                return Err(invalid(format!("path `{}` must start with '/'", route.path)));
            }
            let method = route.method.to_ascii_uppercase();
            if !SUPPORTED_METHODS.contains(&method.as_str()) {
                return Err(invalid(format!("unsupported HTTP method `{}`", route.method)));
            }
            if !is_valid_handler(&route.handler) {
                return Err(invalid(format!("invalid handler name `{}`", route.handler)));
            }
            if let Some(limit) = &route.rate_limit {
                if limit.requests == 0 || limit.window_ms == 0 {
                    return Err(invalid("rate_limit needs positive `requests` and `window_ms`".into()));
                }
            }
            if !seen.insert((method.clone(), route.path.as_str())) {
                return Err(ManifestError::DuplicateRoute {
                    method,
                    path: route.path.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_dependencies(&self) -> Result<(), ManifestError> {
        for dependency in &self.dependencies {
            let invalid = |reason: String| ManifestError::InvalidDependency {
                id: dependency.id.clone(),
                reason,
            };
            if !is_valid_id(&dependency.id) {
                return Err(invalid("not a valid plugin id".into()));
            }
            if dependency.id == self.id {
                return Err(invalid("a plugin cannot depend on itself".into()));
            }
            dependency
                .requirement()
                .map_err(|err| invalid(format!("bad version requirement: {err}")))?;
        }
        Ok(())
    }

    /// Artifact file name the build produces and the loader opens.
    pub fn entry_name(&self) -> &str {
        self.entry.as_deref().unwrap_or(&self.id)
    }

    /// Host-side path for `route` under a prefix template such as
    /// `/api/plugins/{id}`.
    pub fn mount_path(&self, prefix: &str, route: &RouteDecl) -> String {
        let prefix = prefix.replace("{id}", &self.id);
        format!("{}{}", prefix.trim_end_matches('/'), route.path)
    }

    pub fn requires_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn to_toml(&self) -> Result<String, ManifestError> {
        toml::to_string(self).map_err(|err| ManifestError::Serialize(err.to_string()))
    }
}
