use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use ksp_plugin_sdk::{json, serve, text, Plugin};
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Default)]
struct Analytics {
    label: String,
    counts: Mutex<BTreeMap<String, u64>>,
}

impl Plugin for Analytics {
    fn init(&mut self, config: Value) -> Result<()> {
        self.label = config
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        Ok(())
    }

    fn handle(&self, handler: &str, request: Request<Bytes>) -> Result<Response<Bytes>> {
        match handler {
            "stats" => {
                let counts = self.counts.lock().clone();
                let total: u64 = counts.values().sum();
                Ok(json(
                    StatusCode::OK,
                    &json!({ "label": self.label, "total": total, "kinds": counts }),
                ))
            }
            "track" => {
                let body: Value = serde_json::from_slice(request.body())
                    .context("event body must be JSON")?;
                let Some(kind) = body.get("kind").and_then(Value::as_str) else {
                    return Ok(text(StatusCode::BAD_REQUEST, "missing `kind`"));
                };
                let mut counts = self.counts.lock();
                let count = counts.entry(kind.to_string()).or_default();
                *count += 1;
                Ok(json(StatusCode::ACCEPTED, &json!({ "kind": kind, "count": *count })))
            }
            "kind_count" => {
                let kind = request.uri().path().rsplit('/').next().unwrap_or_default();
                let count = self.counts.lock().get(kind).copied().unwrap_or(0);
                Ok(json(StatusCode::OK, &json!({ "kind": kind, "count": count })))
            }
            other => bail!("unknown handler `{other}`"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    serve(Analytics::default()).await
}
