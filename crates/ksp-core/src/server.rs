use std::{
    convert::Infallible,
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
    task::JoinSet,
};
use tokio_rustls::{
    rustls::{Certificate, PrivateKey, ServerConfig},
    TlsAcceptor,
};
use tower::ServiceBuilder;
use tracing::Instrument;

use crate::{
    config::{Config, ResolvedListener},
    error::PluginError,
    fetch::PluginSource,
    manager::PluginManager,
    policy::Rejection,
};

pub type HostBody = Full<Bytes>;

const ADMIN_PREFIX: &str = "/admin";

/// Remote address of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Serves plugin routes and the admin API on every configured listener.
pub struct Server {
    state: Arc<AppState>,
    listeners: Vec<ListenerRuntime>,
}

struct AppState {
    manager: Arc<PluginManager>,
    admin: bool,
    request_timeout: Duration,
}

struct ListenerRuntime {
    name: String,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: &Config, manager: Arc<PluginManager>) -> Result<Self> {
        config.validate()?;
        let listeners = config
            .resolved_listeners()?
            .into_iter()
            .map(ListenerRuntime::try_from)
            .collect::<Result<Vec<_>>>()?;
        let state = Arc::new(AppState {
            manager,
            admin: config.admin.enabled,
            request_timeout: config.routes.request_timeout(),
        });
        Ok(Self { state, listeners })
    }

    /// Runs until Ctrl+C, then stops listeners, the health monitor and every
    /// plugin.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    pub async fn run_until(self, signal: impl Future<Output = ()>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut bound = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners {
            let tcp = TcpListener::bind(listener.addr)
                .await
                .with_context(|| format!("failed to bind listener `{}`", listener.name))?;
            bound.push((listener, tcp));
        }

        let mut join_set = JoinSet::new();
        for (listener, tcp) in bound {
            let rx = shutdown_rx.clone();
            let state = self.state.clone();
            join_set.spawn(async move { serve_listener(listener, tcp, state, rx).await });
        }
        let health = self.state.manager.start_health_monitor(shutdown_rx.clone());

        tracing::info!("host listeners started; awaiting shutdown signal");
        signal.await;
        tracing::info!("shutdown signal received; draining listeners");
        shutdown_tx.send(true).ok();

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Err(err)) => tracing::error!(error = %err, "listener failed"),
                Err(err) => tracing::error!(error = %err, "listener task aborted"),
                Ok(Ok(())) => {}
            }
        }
        if let Err(err) = health.await {
            tracing::warn!(error = %err, "health monitor task aborted");
        }
        self.state.manager.shutdown().await;
        Ok(())
    }

    /// Handles one request with its body already read.
    pub async fn handle(&self, req: Request<Bytes>) -> Response<HostBody> {
        handle_request(&self.state, req).await
    }
}

async fn serve_listener(
    listener: ListenerRuntime,
    tcp: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!(
        listener = %listener.name,
        addr = %listener.addr,
        tls = listener.acceptor.is_some(),
        "listener ready"
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                tracing::info!(listener = %listener.name, "listener shutting down");
                break;
            }
            accept = tcp.accept() => {
                let (stream, peer_addr) = accept?;
                let acceptor = listener.acceptor.clone();
                let state = state.clone();
                let listener_name = listener.name.clone();
                tokio::spawn(async move {
                    let result = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => serve_connection(tls, peer_addr, state).await,
                            Err(err) => Err(anyhow!("tls handshake failed: {err}")),
                        },
                        None => serve_connection(stream, peer_addr, state).await,
                    };
                    if let Err(err) = result {
                        tracing::warn!(
                            listener = %listener_name,
                            peer = %peer_addr,
                            error = %err,
                            "connection closed with error"
                        );
                    }
                });
            }
        }
    }

    Ok(())
}

/// The request timeout bounds plugin dispatch only; admin lifecycle calls
/// run as long as the build and load budgets allow.
async fn serve_connection<I>(io: I, peer: SocketAddr, state: Arc<AppState>) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = ServiceBuilder::new()
        .map_request(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ClientAddr(peer));
            req
        })
        .service_fn(move |req: Request<Incoming>| {
            let state = state.clone();
            async move {
                let (parts, body) = req.into_parts();
                let response = match body.collect().await {
                    Ok(collected) => {
                        let req = Request::from_parts(parts, collected.to_bytes());
                        handle_request(&state, req).await
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "failed to read request body");
                        response_with(StatusCode::BAD_REQUEST, "unreadable request body")
                    }
                };
                Ok::<_, Infallible>(response)
            }
        });
    http1::Builder::new()
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(service))
        .await
        .context("connection handling failed")
}

async fn handle_request(state: &AppState, req: Request<Bytes>) -> Response<HostBody> {
    let start = Instant::now();
    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        plugin = tracing::field::Empty,
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );
    let response = async {
        if state.admin && is_admin_path(req.uri().path()) {
            handle_admin(&state.manager, req).await
        } else {
            dispatch(state, req, &span).await
        }
    }
    .instrument(span.clone())
    .await;
    span.record("status", response.status().as_u16());
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    response
}

fn is_admin_path(path: &str) -> bool {
    path == ADMIN_PREFIX || path.starts_with("/admin/")
}

async fn dispatch(state: &AppState, mut req: Request<Bytes>, span: &tracing::Span) -> Response<HostBody> {
    let Some((resolution, target)) = state.manager.route(req.method(), req.uri().path()) else {
        metrics::counter!("ksp_requests_total", "outcome" => "miss").increment(1);
        return response_with(StatusCode::NOT_FOUND, "no matching route");
    };
    let plugin_id = resolution.plugin_id.as_str();
    span.record("plugin", plugin_id);

    if !target.enabled {
        metrics::counter!("ksp_requests_total", "outcome" => "disabled").increment(1);
        return response_with(StatusCode::SERVICE_UNAVAILABLE, "plugin disabled");
    }
    if !target.status.is_running() {
        metrics::counter!("ksp_requests_total", "outcome" => "unavailable").increment(1);
        return response_with(StatusCode::SERVICE_UNAVAILABLE, "plugin unavailable");
    }

    let client = req
        .extensions()
        .get::<ClientAddr>()
        .map(|addr| addr.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if let Err(rejection) = resolution.policy.check(&req, client) {
        metrics::counter!("ksp_requests_total", "outcome" => "rejected").increment(1);
        tracing::debug!(plugin = %plugin_id, %client, reason = %rejection.reason, "request rejected");
        return rejection_response(&rejection);
    }

    match plugin_uri(&resolution.plugin_path, req.uri()) {
        Ok(uri) => *req.uri_mut() = uri,
        Err(err) => {
            tracing::warn!(error = %err, "failed to rewrite request uri");
            return response_with(StatusCode::BAD_REQUEST, "invalid request path");
        }
    }

    let call = target.instance.dispatch(&resolution.handler, req);
    match tokio::time::timeout(state.request_timeout, call).await {
        Ok(Ok(response)) => {
            metrics::counter!("ksp_requests_total", "outcome" => "hit").increment(1);
            state.manager.record_dispatch(plugin_id, None);
            response.map(Full::new)
        }
        Ok(Err(err)) => {
            tracing::error!(
                error = %err,
                plugin = %plugin_id,
                handler = %resolution.handler,
                "plugin request failed"
            );
            metrics::counter!("ksp_requests_total", "outcome" => "error").increment(1);
            state.manager.record_dispatch(plugin_id, Some(&err.to_string()));
            response_with(StatusCode::BAD_GATEWAY, "plugin error")
        }
        Err(_) => {
            metrics::counter!("ksp_requests_total", "outcome" => "timeout").increment(1);
            let message = format!("no response within {:?}", state.request_timeout);
            state.manager.record_dispatch(plugin_id, Some(&message));
            response_with(StatusCode::GATEWAY_TIMEOUT, "plugin request timed out")
        }
    }
}

fn rejection_response(rejection: &Rejection) -> Response<HostBody> {
    let kind = if rejection.status == StatusCode::TOO_MANY_REQUESTS {
        "rate_limited"
    } else {
        "invalid_request"
    };
    let mut response = error_response(rejection.status, kind, rejection.reason.clone());
    if let Some(retry_after) = rejection.retry_after {
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn plugin_uri(plugin_path: &str, incoming: &Uri) -> Result<Uri> {
    let target = match incoming.query() {
        Some(query) => format!("{plugin_path}?{query}"),
        None => plugin_path.to_string(),
    };
    target.parse().context("failed to construct plugin uri")
}

#[derive(Deserialize)]
struct LoadRequest {
    source: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    kind: &'a str,
}

async fn handle_admin(manager: &Arc<PluginManager>, req: Request<Bytes>) -> Response<HostBody> {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let segments: Vec<&str> = path
        .trim_start_matches(ADMIN_PREFIX)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let method = req.method().clone();

    match (method, segments.as_slice()) {
        (Method::GET, ["plugins"]) => json_response(StatusCode::OK, &manager.list()),
        (Method::POST, ["plugins"]) => {
            let body: LoadRequest = match serde_json::from_slice(req.body()) {
                Ok(body) => body,
                Err(err) => {
                    return error_response(StatusCode::BAD_REQUEST, "bad_request", err.to_string())
                }
            };
            let source = PluginSource::parse(&body.source);
            match detached(manager, |m| async move { m.load_from_source(source).await }).await {
                Ok(info) => json_response(StatusCode::CREATED, &info),
                Err(err) => plugin_error(&err),
            }
        }
        (Method::GET, ["plugins", id]) => result_response(manager.status(id)),
        (Method::DELETE, ["plugins", id]) => {
            let owned = id.to_string();
            match detached(manager, |m| async move { m.unload(&owned).await }).await {
                Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "unloaded": id })),
                Err(err) => plugin_error(&err),
            }
        }
        (Method::POST, ["plugins", id, "reload"]) => {
            let id = id.to_string();
            result_response(detached(manager, |m| async move { m.reload(&id).await }).await)
        }
        (Method::POST, ["plugins", id, "enable"]) => result_response(manager.enable(id).await),
        (Method::POST, ["plugins", id, "disable"]) => result_response(manager.disable(id).await),
        (Method::GET, ["plugins", id, "health"]) => result_response(manager.health(id)),
        (Method::DELETE, ["plugins", id, "errors"]) => result_response(manager.clear_errors(id)),
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &manager.health_summary()),
        (Method::GET, ["metrics"]) => json_response(StatusCode::OK, &manager.metrics()),
        (Method::GET, ["cache"]) => json_response(StatusCode::OK, &manager.build_cache_info()),
        (Method::DELETE, ["cache"]) => match manager.clear_build_cache().await {
            Ok(cleared) => json_response(StatusCode::OK, &serde_json::json!({ "cleared": cleared })),
            Err(err) => plugin_error(&err),
        },
        (_, ["plugins"] | ["plugins", _] | ["plugins", _, _] | ["health"] | ["metrics"] | ["cache"]) => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "method not allowed".into())
        }
        _ => error_response(StatusCode::NOT_FOUND, "not_found", "no such admin endpoint".into()),
    }
}

/// Runs a lifecycle call on its own task. It completes even when the client
/// disconnects and hyper drops the request future.
async fn detached<T, F, Fut>(manager: &Arc<PluginManager>, op: F) -> Result<T, PluginError>
where
    F: FnOnce(Arc<PluginManager>) -> Fut,
    Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(op(manager.clone())).await {
        Ok(result) => result,
        Err(err) => Err(PluginError::Io(std::io::Error::other(format!(
            "lifecycle task failed: {err}"
        )))),
    }
}

fn result_response<T: Serialize>(result: Result<T, PluginError>) -> Response<HostBody> {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(err) => plugin_error(&err),
    }
}

fn plugin_error(err: &PluginError) -> Response<HostBody> {
    error_response(err.status_code(), err.kind(), err.to_string())
}

fn error_response(status: StatusCode, kind: &str, error: String) -> Response<HostBody> {
    json_response(status, &ErrorBody { error, kind })
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<HostBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to encode admin response");
            response_with(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn response_with(status: StatusCode, msg: &'static str) -> Response<HostBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(msg.as_bytes())));
    *response.status_mut() = status;
    response
}

impl TryFrom<ResolvedListener> for ListenerRuntime {
    type Error = anyhow::Error;

    fn try_from(value: ResolvedListener) -> Result<Self> {
        let acceptor = match &value.tls {
            Some(_) => Some(TlsAcceptor::from(Arc::new(build_tls_config(&value)?))),
            None => None,
        };
        Ok(Self {
            name: value.name,
            addr: value.addr,
            acceptor,
        })
    }
}

fn build_tls_config(listener: &ResolvedListener) -> Result<ServerConfig> {
    let tls = listener
        .tls
        .as_ref()
        .context("listener has no tls section")?;
    let certs = load_certs(&tls.cert)?;
    let key = load_private_key(&tls.key)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| format!("invalid certificate/key pair for listener `{}`", listener.name))?;
    config.alpn_protocols = listener
        .alpn
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect();
    Ok(config)
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let data = std::fs::read(path).with_context(|| format!("failed to read cert {path}"))?;
    let mut reader = std::io::Cursor::new(data);
    let raw =
        rustls_pemfile::certs(&mut reader).map_err(|_| anyhow!("invalid certificate data"))?;
    if raw.is_empty() {
        anyhow::bail!("no certificates found in {path}");
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let data = std::fs::read(path).with_context(|| format!("failed to read key {path}"))?;
    let mut reader = std::io::Cursor::new(data);
    while let Some(item) =
        rustls_pemfile::read_one(&mut reader).map_err(|_| anyhow!("invalid key format"))?
    {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    anyhow::bail!("no usable private keys found in {path}")
}
