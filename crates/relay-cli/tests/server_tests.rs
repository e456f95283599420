//! HTTP surface tests against a live in-process server.

use std::sync::Arc;

use relay_cli::hmr::{HmrEvent, HmrHub};
use relay_cli::protocol::BuildData;
use relay_cli::{AppState, Backend, router};
use relay_core::BuildContext;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};

async fn start_server() -> (String, Arc<HmrHub>) {
    let hub = Arc::new(HmrHub::new());
    let state = AppState::new(
        Backend::InProcess(BuildContext::with_rolldown()),
        Arc::clone(&hub),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    (addr, hub)
}

/// Send one HTTP/1.1 request and return `(status, body)`.
async fn request(addr: &str, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status = response[9..12].parse().unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

fn parse_build_data(body: &str) -> BuildData {
    serde_json::from_str(body).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_page() {
    let (addr, _hub) = start_server().await;

    let (status, body) = request(&addr, "GET", "/", "").await;

    assert_eq!(status, 200);
    assert!(body.contains("Builds (in-process)"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_without_config_reports_config_error() {
    let temp = TempDir::new().unwrap();
    let (addr, _hub) = start_server().await;
    let body = serde_json::json!({
        "cache": false,
        "cacheDir": temp.path(),
    })
    .to_string();

    let (status, body) = request(&addr, "POST", "/build", &body).await;

    assert_eq!(status, 200);
    let data = parse_build_data(&body);
    assert_eq!(data.error.unwrap().kind, "ConfigError");
    assert!(data.data.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_with_project() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("index.js"), "export default \"X\";\n").unwrap();
    let config = temp.path().join("relay.config.json");
    std::fs::write(
        &config,
        r#"{"entry": {"main": "./index.js"}, "output": {"path": "dist"}}"#,
    )
    .unwrap();
    let (addr, _hub) = start_server().await;
    let body = serde_json::json!({
        "config": config,
        "cacheDir": temp.path().join("cache"),
    })
    .to_string();

    let (status, body) = request(&addr, "POST", "/build", &body).await;

    assert_eq!(status, 200);
    let data = parse_build_data(&body);
    assert!(data.error.is_none(), "unexpected error: {:?}", data.error);
    let output = data.data.unwrap();
    assert!(!output["assets"].as_array().unwrap().is_empty());
    assert!(output["dependencies"]["rolldown"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_build_request() {
    let (addr, _hub) = start_server().await;

    let (status, body) = request(&addr, "POST", "/build", "{not json").await;

    assert_eq!(status, 400);
    assert_eq!(parse_build_data(&body).error.unwrap().kind, "RequestError");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hmr_stream_delivers_events() {
    let (addr, hub) = start_server().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let request = format!("GET /__hmr__/abc HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let subscribed = async {
        while hub.clients("/abc") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), subscribed).await.unwrap();
    hub.publish("/abc", HmrEvent::Invalid);

    let mut received = String::new();
    let mut buf = [0u8; 1024];
    let read = async {
        while !received.contains(r#"data: {"type":"invalid"}"#) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed early");
            received.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    };
    timeout(Duration::from_secs(5), read).await.unwrap();
    assert!(received.contains("text/event-stream"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_hmr_path_is_served() {
    let temp = TempDir::new().unwrap();
    let (addr, hub) = start_server().await;

    let (status, _) = request(&addr, "GET", "/__live__/app", "").await;
    assert_eq!(status, 404);

    // The config is missing, but the request still announces its HMR path.
    let body = serde_json::json!({
        "cacheDir": temp.path(),
        "hmr": true,
        "hmrPath": "/__live__",
        "hmrNamespace": "/app",
    })
    .to_string();
    let (status, _) = request(&addr, "POST", "/build", &body).await;
    assert_eq!(status, 200);

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let request = format!("GET /__live__/app HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let subscribed = async {
        while hub.clients("/app") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), subscribed).await.unwrap();
    hub.publish("/app", HmrEvent::Invalid);

    let mut received = String::new();
    let mut buf = [0u8; 1024];
    let read = async {
        while !received.contains(r#"data: {"type":"invalid"}"#) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed early");
            received.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    };
    timeout(Duration::from_secs(5), read).await.unwrap();
    assert!(received.contains("text/event-stream"));
}
