use std::{convert::Infallible, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::{
    protocol::{PluginEnv, HANDLER_HEADER},
    Plugin,
};

/// Runs `plugin` on the address the host assigned until the process receives
/// Ctrl+C or the host kills it.
pub async fn serve<P: Plugin>(mut plugin: P) -> Result<()> {
    let env = PluginEnv::from_env()?;
    plugin
        .init(env.config.clone())
        .with_context(|| format!("plugin `{}` failed to initialise", env.plugin_id))?;

    let tcp = TcpListener::bind(env.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", env.listen_addr))?;
    tracing::info!(plugin = %env.plugin_id, addr = %env.listen_addr, "plugin listening");

    let plugin = Arc::new(plugin);
    let health_endpoint: Arc<str> = env.health_endpoint.into();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(plugin = %env.plugin_id, "plugin shutting down");
                break;
            }
            accept = tcp.accept() => {
                let (stream, _) = accept?;
                let plugin = plugin.clone();
                let health_endpoint = health_endpoint.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let plugin = plugin.clone();
                        let health_endpoint = health_endpoint.clone();
                        async move {
                            let response = match collect(req).await {
                                Ok(req) => respond(plugin.as_ref(), &health_endpoint, req),
                                Err(err) => text(StatusCode::BAD_REQUEST, err.to_string()),
                            };
                            Ok::<_, Infallible>(response.map(Full::new))
                        }
                    });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!(error = %err, "host connection closed with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn collect(req: Request<Incoming>) -> Result<Request<Bytes>> {
    let (parts, body) = req.into_parts();
    let bytes = body.collect().await?.to_bytes();
    Ok(Request::from_parts(parts, bytes))
}

/// Answers one host request: health probes on `health_endpoint`, everything
/// else routed by the handler header.
pub fn respond<P: Plugin + ?Sized>(
    plugin: &P,
    health_endpoint: &str,
    req: Request<Bytes>,
) -> Response<Bytes> {
    if req.method() == Method::GET && req.uri().path() == health_endpoint {
        return match plugin.health() {
            Ok(()) => text(StatusCode::OK, "ok"),
            Err(err) => text(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        };
    }

    let Some(handler) = req
        .headers()
        .get(HANDLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
    else {
        return text(StatusCode::BAD_REQUEST, format!("missing {HANDLER_HEADER} header"));
    };

    match plugin.handle(&handler, req) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(handler = %handler, error = %err, "handler failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Plain-text response helper for plugin handlers.
pub fn text(status: StatusCode, body: impl Into<String>) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.into()));
    *response.status_mut() = status;
    response
}

/// JSON response helper for plugin handlers.
pub fn json(status: StatusCode, value: &serde_json::Value) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}
