pub mod artifact;
pub mod build;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod health;
pub mod host;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod routes;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{PluginError, Result};
pub use events::{EventBus, LifecycleEvent};
pub use fetch::PluginSource;
pub use health::{HealthSummary, OverallHealth};
pub use host::{PluginHost, PluginInstance, ProcessHost};
pub use manager::PluginManager;
pub use registry::{HealthStatus, PluginInfo, RegistryMetrics, RuntimeStatus};
pub use server::Server;

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
