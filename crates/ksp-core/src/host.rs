use std::{
    net::{Ipv4Addr, SocketAddr},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use ksp_plugin_sdk::{
    protocol::{
        ENV_HEALTH_ENDPOINT, ENV_LISTEN_ADDR, ENV_PLUGIN_CONFIG, ENV_PLUGIN_ID, HANDLER_HEADER,
        PLUGIN_HEADER,
    },
    Manifest,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::Mutex,
    time::{sleep, timeout},
};

use crate::{artifact::VerifiedArtifact, error::PluginError};

pub type HttpRequest = Request<Bytes>;
pub type HttpResponse = Response<Bytes>;
type HttpClient = Client<HttpConnector, Full<Bytes>>;

const READY_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const STARTUP_ATTEMPTS: usize = 3;

/// A running plugin the host can probe, call into and stop.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    /// `Err` carries a human readable reason.
    async fn probe(&self) -> Result<(), String>;

    /// Sends `request` to `handler`. The request path is already relative to
    /// the plugin's mount point.
    async fn dispatch(&self, handler: &str, request: HttpRequest) -> anyhow::Result<HttpResponse>;

    async fn shutdown(&self);

    fn describe(&self) -> String {
        String::from("in-process")
    }
}

/// Starts plugin instances from verified artifacts.
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn launch(
        &self,
        artifact: &VerifiedArtifact,
        manifest: &Manifest,
    ) -> Result<Arc<dyn PluginInstance>, PluginError>;
}

/// Runs each plugin as a child process serving HTTP on a loopback port.
pub struct ProcessHost {
    client: HttpClient,
}

impl Default for ProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHost {
    pub fn new() -> Self {
        Self {
            client: build_client(),
        }
    }
}

fn build_client() -> HttpClient {
    let connector = HttpConnector::new();
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Picks a free loopback port. The listener is dropped before the child
/// binds, so another process can grab the port in between; `launch` retries
/// on a fresh port when the child exits during startup.
fn reserve_port() -> std::io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    listener.local_addr()
}

impl ProcessHost {
    fn spawn(
        &self,
        artifact: &VerifiedArtifact,
        manifest: &Manifest,
        config: &str,
    ) -> Result<ProcessInstance, PluginError> {
        let id = manifest.id.as_str();
        let addr = reserve_port().map_err(|err| PluginError::load_failed(id, err))?;
        let mut child = Command::new(&artifact.path)
            .env(ENV_PLUGIN_ID, id)
            .env(ENV_LISTEN_ADDR, addr.to_string())
            .env(ENV_PLUGIN_CONFIG, config)
            .env(ENV_HEALTH_ENDPOINT, &manifest.health.endpoint)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PluginError::load_failed(id, format!("spawn failed: {err}")))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(id.to_string(), "stderr", stderr);
        }
        tracing::debug!(plugin = %id, pid = ?child.id(), addr = %addr, "plugin process spawned");

        Ok(ProcessInstance {
            id: id.to_string(),
            addr,
            health_endpoint: manifest.health.endpoint.clone(),
            client: self.client.clone(),
            child: Mutex::new(Some(child)),
        })
    }
}

#[async_trait]
impl PluginHost for ProcessHost {
    async fn launch(
        &self,
        artifact: &VerifiedArtifact,
        manifest: &Manifest,
    ) -> Result<Arc<dyn PluginInstance>, PluginError> {
        let id = manifest.id.as_str();
        let config = serde_json::to_string(&manifest.config)
            .map_err(|err| PluginError::load_failed(id, err))?;

        let mut attempt = 1;
        loop {
            let instance = self.spawn(artifact, manifest, &config)?;
            match instance.wait_ready().await {
                Ok(()) => return Ok(Arc::new(instance)),
                Err(status) if attempt < STARTUP_ATTEMPTS => {
                    tracing::warn!(
                        plugin = %id,
                        addr = %instance.addr,
                        %status,
                        attempt,
                        "plugin exited during startup; retrying on a fresh port"
                    );
                    attempt += 1;
                }
                Err(status) => {
                    return Err(PluginError::load_failed(
                        id,
                        format!("process exited during startup ({status}) after {attempt} attempts"),
                    ))
                }
            }
        }
    }
}

fn forward_output<R>(plugin: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(plugin = %plugin, stream, "{line}");
        }
    });
}

struct ProcessInstance {
    id: String,
    addr: SocketAddr,
    health_endpoint: String,
    client: HttpClient,
    child: Mutex<Option<Child>>,
}

impl ProcessInstance {
    /// Polls until the plugin answers its health endpoint. `Err` carries the
    /// exit status when the process dies first. The caller bounds this with
    /// the load timeout.
    async fn wait_ready(&self) -> Result<(), String> {
        loop {
            if let Some(status) = self.exit_status().await {
                return Err(status);
            }
            match self.probe().await {
                Ok(()) => return Ok(()),
                Err(reason) => tracing::trace!(plugin = %self.id, %reason, "plugin not ready yet"),
            }
            sleep(READY_POLL).await;
        }
    }

    async fn exit_status(&self) -> Option<String> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            None => Some("already stopped".into()),
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(err) => Some(err.to_string()),
            },
        }
    }

    fn uri(&self, path_and_query: &str) -> anyhow::Result<Uri> {
        format!("http://{}{}", self.addr, path_and_query)
            .parse()
            .context("failed to construct plugin uri")
    }
}

#[async_trait]
impl PluginInstance for ProcessInstance {
    async fn probe(&self) -> Result<(), String> {
        let uri = self.uri(&self.health_endpoint).map_err(|err| err.to_string())?;
        let request = Request::get(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|err| err.to_string())?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        Err(format!(
            "health endpoint returned {status}: {}",
            String::from_utf8_lossy(&body).trim()
        ))
    }

    async fn dispatch(&self, handler: &str, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let (mut parts, body) = request.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = self.uri(target)?;
        clean_hop_by_hop(&mut parts.headers);
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(&self.addr.to_string())?,
        );
        parts
            .headers
            .insert(HANDLER_HEADER, HeaderValue::from_str(handler)?);
        parts
            .headers
            .insert(PLUGIN_HEADER, HeaderValue::from_str(&self.id)?);

        let response = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|err| anyhow!("plugin `{}` unreachable: {err}", self.id))?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }

    async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(err) = child.start_kill() {
            tracing::debug!(plugin = %self.id, error = %err, "plugin process already gone");
        }
        match timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(plugin = %self.id, %status, "plugin process stopped"),
            Ok(Err(err)) => tracing::warn!(plugin = %self.id, error = %err, "failed to reap plugin process"),
            Err(_) => tracing::warn!(plugin = %self.id, "plugin process did not exit in time"),
        }
    }

    fn describe(&self) -> String {
        format!("process on {}", self.addr)
    }
}

pub(crate) fn clean_hop_by_hop(headers: &mut http::HeaderMap) {
    const HOP_HEADERS: [&str; 7] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "transfer-encoding",
        "upgrade",
    ];
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}
