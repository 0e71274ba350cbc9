pub mod manifest;
pub mod protocol;
pub mod server;

pub use manifest::{
    parse_manifest, Manifest, ManifestError, RateLimit, RequestValidation, RouteDecl, MANIFEST_FILE,
};
pub use server::{json, serve, text};

use bytes::Bytes;
use http::{Request, Response};
use serde_json::Value;

/// Implemented by plugin executables built against this crate.
///
/// `handler` is the manifest route handler the host matched; path parameters
/// are left in the request path.
pub trait Plugin: Send + Sync + 'static {
    fn init(&mut self, config: Value) -> anyhow::Result<()>;

    fn health(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle(&self, handler: &str, request: Request<Bytes>) -> anyhow::Result<Response<Bytes>>;
}
