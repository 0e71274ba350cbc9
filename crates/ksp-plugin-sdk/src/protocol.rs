use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::manifest::DEFAULT_HEALTH_ENDPOINT;

pub const ENV_PLUGIN_ID: &str = "KSP_PLUGIN_ID";
pub const ENV_LISTEN_ADDR: &str = "KSP_LISTEN_ADDR";
pub const ENV_PLUGIN_CONFIG: &str = "KSP_PLUGIN_CONFIG";
pub const ENV_HEALTH_ENDPOINT: &str = "KSP_HEALTH_ENDPOINT";

/// Names the manifest handler a forwarded request is meant for.
pub const HANDLER_HEADER: &str = "x-ksp-handler";
pub const PLUGIN_HEADER: &str = "x-ksp-plugin";

/// Launch parameters the host hands to a plugin process.
#[derive(Debug, Clone)]
pub struct PluginEnv {
    pub plugin_id: String,
    pub listen_addr: SocketAddr,
    pub config: Value,
    pub health_endpoint: String,
}

impl PluginEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let plugin_id = lookup(ENV_PLUGIN_ID).with_context(|| format!("{ENV_PLUGIN_ID} is not set"))?;
        let listen_addr = lookup(ENV_LISTEN_ADDR)
            .with_context(|| format!("{ENV_LISTEN_ADDR} is not set"))?
            .parse()
            .with_context(|| format!("{ENV_LISTEN_ADDR} is not a socket address"))?;
        let config = match lookup(ENV_PLUGIN_CONFIG) {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .with_context(|| format!("{ENV_PLUGIN_CONFIG} is not valid JSON"))?,
            _ => Value::Object(Default::default()),
        };
        let health_endpoint =
            lookup(ENV_HEALTH_ENDPOINT).unwrap_or_else(|| DEFAULT_HEALTH_ENDPOINT.to_string());
        Ok(Self {
            plugin_id,
            listen_addr,
            config,
            health_endpoint,
        })
    }
}
