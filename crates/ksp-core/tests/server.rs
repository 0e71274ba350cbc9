#![cfg(target_os = "linux")]

mod common;

use std::{
    net::TcpListener as StdTcpListener,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use bytes::Bytes;
use common::{manifest, Harness};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use ksp_core::Server;
use ksp_plugin_sdk::{RateLimit, RequestValidation, RouteDecl};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
};

fn request(method: Method, uri: &str, body: &str) -> Request<Bytes> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: Response<Full<Bytes>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response<Full<Bytes>>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

async fn serve_demo(harness: &Harness) -> (Server, Arc<ksp_core::PluginManager>) {
    let manager = Arc::new(harness.manager());
    manager
        .load_from_directory(harness.source(&manifest("demo-analytics", "1.0.0")))
        .await
        .unwrap();
    let server = Server::new(&harness.config, manager.clone()).unwrap();
    (server, manager)
}

#[tokio::test]
async fn requests_reach_the_plugin_with_the_mount_prefix_removed() {
    let harness = Harness::new();
    let (server, _) = serve_demo(&harness).await;

    let response = server
        .handle(request(Method::GET, "/api/plugins/demo-analytics/items/42?full=1", ""))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "demo-analytics@1.0.0 item /items/42?full=1"
    );

    let response = server
        .handle(request(Method::GET, "/api/plugins/demo-analytics/missing", ""))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disabled_plugins_answer_service_unavailable() {
    let harness = Harness::new();
    let (server, manager) = serve_demo(&harness).await;
    manager.disable("demo-analytics").await.unwrap();

    let response = server
        .handle(request(Method::GET, "/api/plugins/demo-analytics/stats", ""))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(harness.host.instance("demo-analytics").calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handler_errors_become_bad_gateway() {
    let harness = Harness::new();
    let (server, _) = serve_demo(&harness).await;
    let response = server
        .handle(request(Method::POST, "/api/plugins/demo-analytics/boom", ""))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn admin_lists_and_describes_plugins() {
    let harness = Harness::new();
    let (server, _) = serve_demo(&harness).await;

    let list = body_json(server.handle(request(Method::GET, "/admin/plugins", "")).await).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], "demo-analytics");
    assert_eq!(list[0]["status"], "active");

    let health = body_json(server.handle(request(Method::GET, "/admin/health", "")).await).await;
    assert_eq!(health["healthy"], 1);
    assert_eq!(health["overall_health"], "healthy");

    let response = server
        .handle(request(Method::GET, "/admin/plugins/unknown", ""))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["kind"], "not_found");
}

#[tokio::test]
async fn admin_manages_the_lifecycle() {
    let harness = Harness::new();
    let (server, manager) = serve_demo(&harness).await;

    let response = server
        .handle(request(Method::POST, "/admin/plugins/demo-analytics/disable", ""))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["enabled"], false);

    let response = server
        .handle(request(Method::POST, "/admin/plugins/demo-analytics/enable", ""))
        .await;
    assert_eq!(body_json(response).await["enabled"], true);

    let response = server
        .handle(request(Method::DELETE, "/admin/plugins/demo-analytics", ""))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(manager.list().is_empty());

    let src = harness.source(&manifest("beta", "0.2.0"));
    let body = serde_json::json!({ "source": src.display().to_string() }).to_string();
    let response = server
        .handle(request(Method::POST, "/admin/plugins", &body))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["version"], "0.2.0");

    let response = server
        .handle(request(Method::POST, "/admin/plugins", &body))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn admin_reports_and_clears_the_build_cache() {
    let harness = Harness::new();
    let (server, _) = serve_demo(&harness).await;

    let info = body_json(server.handle(request(Method::GET, "/admin/cache", "")).await).await;
    assert_eq!(info["entries"].as_array().unwrap().len(), 1);

    let cleared = body_json(server.handle(request(Method::DELETE, "/admin/cache", "")).await).await;
    assert_eq!(cleared["cleared"], 1);

    let response = server.handle(request(Method::PUT, "/admin/cache", "")).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn malformed_load_requests_are_bad_requests() {
    let harness = Harness::new();
    let (server, _) = serve_demo(&harness).await;
    let response = server
        .handle(request(Method::POST, "/admin/plugins", "{\"src\": 1}"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_surface_can_be_disabled() {
    let harness = Harness::with_config(|config| config.admin.enabled = false);
    let (server, _) = serve_demo(&harness).await;
    let response = server.handle(request(Method::GET, "/admin/plugins", "")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn slow_plugins_answer_gateway_timeout() {
    let harness = Harness::with_config(|config| config.routes.request_timeout_secs = 1);
    let manager = Arc::new(harness.manager());
    let mut slow = manifest("sluggish", "1.0.0");
    slow.routes.push(RouteDecl::new("GET", "/slow", "slow"));
    manager
        .load_from_directory(harness.source(&slow))
        .await
        .unwrap();
    let server = Server::new(&harness.config, manager.clone()).unwrap();

    let response = server
        .handle(request(Method::GET, "/api/plugins/sluggish/slow", ""))
        .await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let info = manager.status("sluggish").unwrap();
    assert_eq!(info.stats.requests, 1);
    assert_eq!(info.stats.errors, 1);
    assert!(info.stats.recent_errors[0].message.contains("no response"));
}

/// Lifecycle calls are not bounded by the plugin request timeout, so a build
/// that outlasts it still completes over a real connection.
#[tokio::test]
async fn admin_loads_outlast_the_request_timeout() {
    let port = StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let harness = Harness::with_config(|config| {
        config.routes.request_timeout_secs = 1;
        config.listeners[0].bind = format!("127.0.0.1:{port}");
        config.build.args = vec![
            "-c".into(),
            format!("sleep 2 && {}", common::BUILD_SCRIPT),
        ];
    });
    let manager = Arc::new(harness.manager());
    let server = Server::new(&harness.config, manager.clone()).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(server.run_until(async {
        stop_rx.await.ok();
    }));

    let mut stream = None;
    for _ in 0..50 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let mut stream = stream.expect("listener never came up");

    let src = harness.source(&manifest("patient", "1.0.0"));
    let body = serde_json::json!({ "source": src.display().to_string() }).to_string();
    let raw = format!(
        "POST /admin/plugins HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(30), stream.read_to_string(&mut reply))
        .await
        .unwrap()
        .unwrap();

    assert!(reply.starts_with("HTTP/1.1 201"), "{reply}");
    assert!(manager.status("patient").is_ok());

    stop_tx.send(()).ok();
    running.await.unwrap().unwrap();
}

fn guarded_manifest() -> ksp_plugin_sdk::Manifest {
    let mut guarded = manifest("guarded", "1.0.0");
    let mut track = RouteDecl::new("POST", "/events", "track");
    track.validation = Some(RequestValidation {
        content_type: vec!["application/json".into()],
        required: vec!["kind".into()],
    });
    track.rate_limit = Some(RateLimit {
        requests: 2,
        window_ms: 60_000,
    });
    guarded.routes.push(track);
    guarded
}

fn event(body: &str) -> Request<Bytes> {
    Request::builder()
        .method(Method::POST)
        .uri("/api/plugins/guarded/events")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn route_policies_turn_requests_away_before_the_plugin() {
    let harness = Harness::new();
    let manager = Arc::new(harness.manager());
    manager
        .load_from_directory(harness.source(&guarded_manifest()))
        .await
        .unwrap();
    let server = Server::new(&harness.config, manager.clone()).unwrap();

    let response = server.handle(event(r#"{"count": 1}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "invalid_request");

    let response = server
        .handle(request(Method::POST, "/api/plugins/guarded/events", r#"{"kind":"a"}"#))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    for _ in 0..2 {
        let response = server.handle(event(r#"{"kind":"deploy"}"#)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = server.handle(event(r#"{"kind":"deploy"}"#)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(body_json(response).await["kind"], "rate_limited");

    assert_eq!(harness.host.instance("guarded").calls.load(Ordering::SeqCst), 2);
    assert_eq!(manager.status("guarded").unwrap().stats.requests, 2);
}

#[tokio::test]
async fn admin_reports_plugin_metrics_and_health_history() {
    let harness = Harness::new();
    let (server, _) = serve_demo(&harness).await;
    server
        .handle(request(Method::GET, "/api/plugins/demo-analytics/stats", ""))
        .await;
    server
        .handle(request(Method::POST, "/api/plugins/demo-analytics/boom", ""))
        .await;

    let metrics = body_json(server.handle(request(Method::GET, "/admin/metrics", "")).await).await;
    assert_eq!(metrics["total_plugins"], 1);
    assert_eq!(metrics["total_routes"], 3);
    assert_eq!(metrics["total_requests"], 2);
    assert_eq!(metrics["total_errors"], 1);

    let health = body_json(
        server
            .handle(request(Method::GET, "/admin/plugins/demo-analytics/health", ""))
            .await,
    )
    .await;
    assert_eq!(health["plugin_id"], "demo-analytics");
    assert_eq!(health["status"], "healthy");
    assert!(health["total_checks"].is_u64());

    let info = body_json(server.handle(request(Method::GET, "/admin/plugins/demo-analytics", "")).await).await;
    assert_eq!(info["stats"]["recent_errors"][0]["kind"], "dispatch");

    let cleared = body_json(
        server
            .handle(request(Method::DELETE, "/admin/plugins/demo-analytics/errors", ""))
            .await,
    )
    .await;
    assert_eq!(cleared["stats"]["recent_errors"].as_array().unwrap().len(), 0);

    let response = server.handle(request(Method::POST, "/admin/metrics", "")).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
