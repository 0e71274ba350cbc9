use std::{str::FromStr, sync::Arc};

use http::Method;
use ksp_plugin_sdk::{Manifest, ManifestError};
use parking_lot::RwLock;

use crate::{config::ConflictPolicy, error::PluginError, policy::RoutePolicy};

/// Table of every route currently exposed on behalf of loaded plugins.
pub struct RouteTable {
    prefix: String,
    policy: ConflictPolicy,
    routes: RwLock<Vec<MountedRoute>>,
}

#[derive(Debug, Clone)]
pub struct MountedRoute {
    pub plugin_id: String,
    pub method: Method,
    pub pattern: String,
    pub handler: String,
    pub policy: Arc<RoutePolicy>,
    matcher: PathMatcher,
    prefix_segments: usize,
}

impl MountedRoute {
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.pattern)
    }
}

/// Result of matching an inbound request against the table.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub plugin_id: String,
    pub handler: String,
    /// Request path with the mount prefix removed.
    pub plugin_path: String,
    pub params: Vec<(String, String)>,
    pub policy: Arc<RoutePolicy>,
}

impl RouteTable {
    pub fn new(prefix: impl Into<String>, policy: ConflictPolicy) -> Self {
        Self {
            prefix: prefix.into(),
            policy,
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Mounts every route the manifest declares. With `ConflictPolicy::Reject`
    /// nothing is mounted when any route collides with another plugin's.
    pub fn expose(&self, manifest: &Manifest) -> Result<Vec<String>, PluginError> {
        let candidates = self.candidates(manifest)?;
        let mut routes = self.routes.write();
        let accepted = self.admit(&routes, candidates)?;
        let mounted = accepted.iter().map(MountedRoute::describe).collect();
        routes.extend(accepted);
        Ok(mounted)
    }

    /// Removes exactly the routes owned by `plugin_id`.
    pub fn withdraw(&self, plugin_id: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|route| route.plugin_id != plugin_id);
        before - routes.len()
    }

    /// Swaps `plugin_id`'s routes for the manifest's in one step. On conflict
    /// the previous routes stay mounted.
    pub fn replace(&self, manifest: &Manifest) -> Result<Vec<String>, PluginError> {
        let candidates = self.candidates(manifest)?;
        let mut routes = self.routes.write();
        let mut next: Vec<MountedRoute> = routes
            .iter()
            .filter(|route| route.plugin_id != manifest.id)
            .cloned()
            .collect();
        let accepted = self.admit(&next, candidates)?;
        let mounted = accepted.iter().map(MountedRoute::describe).collect();
        next.extend(accepted);
        *routes = next;
        Ok(mounted)
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<Resolution> {
        let segments = split(path);
        let routes = self.routes.read();
        routes
            .iter()
            .filter(|route| route.method == *method)
            .filter_map(|route| {
                route
                    .matcher
                    .capture(&segments)
                    .map(|params| (route, params))
            })
            .max_by_key(|(route, _)| route.matcher.literal_count())
            .map(|(route, params)| Resolution {
                plugin_id: route.plugin_id.clone(),
                handler: route.handler.clone(),
                plugin_path: format!("/{}", segments[route.prefix_segments..].join("/")),
                params,
                policy: route.policy.clone(),
            })
    }

    pub fn routes_for(&self, plugin_id: &str) -> Vec<String> {
        self.routes
            .read()
            .iter()
            .filter(|route| route.plugin_id == plugin_id)
            .map(MountedRoute::describe)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn candidates(&self, manifest: &Manifest) -> Result<Vec<MountedRoute>, PluginError> {
        let prefix = self.prefix.replace("{id}", &manifest.id);
        let prefix_segments = split(&prefix).len();
        manifest
            .routes
            .iter()
            .enumerate()
            .map(|(index, decl)| {
                let method = Method::from_str(&decl.method.to_ascii_uppercase()).map_err(|_| {
                    ManifestError::InvalidRoute {
                        index,
                        reason: format!("unknown method `{}`", decl.method),
                    }
                })?;
                let pattern = manifest.mount_path(&self.prefix, decl);
                Ok(MountedRoute {
                    plugin_id: manifest.id.clone(),
                    method,
                    matcher: PathMatcher::new(&pattern),
                    pattern,
                    handler: decl.handler.clone(),
                    policy: Arc::new(RoutePolicy::from_decl(decl)),
                    prefix_segments,
                })
            })
            .collect()
    }

    fn admit(
        &self,
        existing: &[MountedRoute],
        candidates: Vec<MountedRoute>,
    ) -> Result<Vec<MountedRoute>, PluginError> {
        let mut accepted: Vec<MountedRoute> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let clash = existing
                .iter()
                .chain(accepted.iter())
                .find(|route| {
                    route.method == candidate.method && route.matcher.same_shape(&candidate.matcher)
                })
                .map(|route| route.plugin_id.clone());
            match (clash, self.policy) {
                (None, _) => accepted.push(candidate),
                (Some(owner), ConflictPolicy::Reject) => {
                    return Err(PluginError::RouteConflict {
                        method: candidate.method.to_string(),
                        path: candidate.pattern,
                        owner,
                    })
                }
                (Some(owner), ConflictPolicy::Skip) => {
                    tracing::warn!(
                        plugin = %candidate.plugin_id,
                        route = %candidate.describe(),
                        owner = %owner,
                        "route already exposed; skipping"
                    );
                }
            }
        }
        Ok(accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct PathMatcher {
    segments: Vec<Segment>,
}

impl PathMatcher {
    fn new(pattern: &str) -> Self {
        let segments = split(pattern)
            .into_iter()
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Literal(segment.to_string()),
            })
            .collect();
        Self { segments }
    }

    fn capture(&self, path: &[&str]) -> Option<Vec<(String, String)>> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, actual) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(expected) if expected == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => params.push((name.clone(), actual.to_string())),
            }
        }
        Some(params)
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Literal(_)))
            .count()
    }

    /// Two patterns have the same shape when they match exactly the same
    /// set of paths.
    fn same_shape(&self, other: &PathMatcher) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|pair| match pair {
                    (Segment::Literal(a), Segment::Literal(b)) => a == b,
                    (Segment::Param(_), Segment::Param(_)) => true,
                    _ => false,
                })
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use ksp_plugin_sdk::RouteDecl;

    use super::*;

    fn manifest(id: &str, routes: &[(&str, &str, &str)]) -> Manifest {
        Manifest {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            routes: routes
                .iter()
                .map(|(method, path, handler)| RouteDecl::new(method, path, handler))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_under_plugin_prefix() {
        let table = RouteTable::new("/api/plugins/{id}", ConflictPolicy::Reject);
        table
            .expose(&manifest("demo", &[("GET", "/items/:item", "get_item")]))
            .unwrap();

        let hit = table
            .resolve(&Method::GET, "/api/plugins/demo/items/42")
            .unwrap();
        assert_eq!(hit.plugin_id, "demo");
        assert_eq!(hit.handler, "get_item");
        assert_eq!(hit.plugin_path, "/items/42");
        assert_eq!(hit.params, vec![("item".to_string(), "42".to_string())]);

        assert!(table.resolve(&Method::POST, "/api/plugins/demo/items/42").is_none());
        assert!(table.resolve(&Method::GET, "/api/plugins/demo/items").is_none());
    }

    #[test]
    fn literal_routes_win_over_params() {
        let table = RouteTable::new("/api/plugins/{id}", ConflictPolicy::Reject);
        table
            .expose(&manifest(
                "demo",
                &[("GET", "/items/:item", "get_item"), ("GET", "/items/latest", "latest")],
            ))
            .unwrap();
        let hit = table.resolve(&Method::GET, "/api/plugins/demo/items/latest").unwrap();
        assert_eq!(hit.handler, "latest");
    }

    #[test]
    fn shared_prefix_conflicts_are_rejected_atomically() {
        let table = RouteTable::new("/api/ext", ConflictPolicy::Reject);
        table.expose(&manifest("a", &[("GET", "/status", "status")])).unwrap();

        let err = table
            .expose(&manifest("b", &[("GET", "/other", "other"), ("GET", "/status", "status")]))
            .unwrap_err();
        assert!(matches!(err, PluginError::RouteConflict { ref owner, .. } if owner == "a"));
        assert_eq!(table.len(), 1);
        assert!(table.resolve(&Method::GET, "/api/ext/other").is_none());
    }

    #[test]
    fn skip_policy_mounts_the_rest() {
        let table = RouteTable::new("/api/ext", ConflictPolicy::Skip);
        table.expose(&manifest("a", &[("GET", "/users/:id", "user")])).unwrap();
        let mounted = table
            .expose(&manifest("b", &[("GET", "/users/:name", "user"), ("POST", "/users/:name", "save")]))
            .unwrap();
        assert_eq!(mounted, vec!["POST /api/ext/users/:name".to_string()]);
        assert_eq!(table.resolve(&Method::GET, "/api/ext/users/x").unwrap().plugin_id, "a");
    }

    #[test]
    fn withdraw_removes_only_that_plugin() {
        let table = RouteTable::new("/api/plugins/{id}", ConflictPolicy::Reject);
        table.expose(&manifest("a", &[("GET", "/x", "x")])).unwrap();
        table.expose(&manifest("b", &[("GET", "/x", "x")])).unwrap();
        assert_eq!(table.withdraw("a"), 1);
        assert!(table.resolve(&Method::GET, "/api/plugins/a/x").is_none());
        assert!(table.resolve(&Method::GET, "/api/plugins/b/x").is_some());
        assert_eq!(table.withdraw("a"), 0);
    }

    #[test]
    fn resolutions_carry_the_route_policy() {
        let table = RouteTable::new("/api/plugins/{id}", ConflictPolicy::Reject);
        let mut limited = manifest("demo", &[("GET", "/open", "open")]);
        let mut decl = RouteDecl::new("POST", "/events", "track");
        decl.rate_limit = Some(ksp_plugin_sdk::RateLimit {
            requests: 1,
            window_ms: 1_000,
        });
        limited.routes.push(decl);
        table.expose(&limited).unwrap();

        let open = table.resolve(&Method::GET, "/api/plugins/demo/open").unwrap();
        assert!(open.policy.is_empty());
        let events = table.resolve(&Method::POST, "/api/plugins/demo/events").unwrap();
        assert!(!events.policy.is_empty());
        let again = table.resolve(&Method::POST, "/api/plugins/demo/events").unwrap();
        assert!(Arc::ptr_eq(&events.policy, &again.policy));
    }

    #[test]
    fn replace_swaps_routes_and_keeps_old_on_conflict() {
        let table = RouteTable::new("/api/ext", ConflictPolicy::Reject);
        table.expose(&manifest("a", &[("GET", "/v1", "v1")])).unwrap();
        table.expose(&manifest("b", &[("GET", "/taken", "t")])).unwrap();

        table.replace(&manifest("a", &[("GET", "/v2", "v2")])).unwrap();
        assert!(table.resolve(&Method::GET, "/api/ext/v1").is_none());
        assert_eq!(table.resolve(&Method::GET, "/api/ext/v2").unwrap().handler, "v2");

        assert!(table.replace(&manifest("a", &[("GET", "/taken", "t")])).is_err());
        assert_eq!(table.routes_for("a"), vec!["GET /api/ext/v2".to_string()]);
    }
}
