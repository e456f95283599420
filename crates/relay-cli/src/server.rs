//! HTTP surface.
//!
//! - `GET /` operational status page
//! - `POST /build` raw build options in, `{error, data}` out
//! - `GET /__hmr__/{namespace}` server-sent HMR events for one build
//!
//! Builds that set a custom `hmrPath` have their events served under that
//! prefix as well, once the first request for it has been seen.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{Method, StatusCode, Uri},
    response::{
        Html, IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use relay_core::options::DEFAULT_HMR_PATH;
use relay_core::{BuildContext, ContextStatus, RawOptions, resolve};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{CliError, Result};
use crate::hmr::{self, HmrHub};
use crate::protocol::BuildData;
use crate::ui;
use crate::worker::{WorkerPool, WorkerStatus};

/// Where builds run.
pub enum Backend {
    /// Builds run in the server process.
    InProcess(BuildContext),
    /// Builds are sent to worker processes.
    Workers(WorkerPool),
}

impl Backend {
    async fn build(&self, raw: RawOptions, hub: &Arc<HmrHub>) -> BuildData {
        match self {
            Backend::InProcess(context) => {
                let pending = context.build(raw);
                hmr::attach(hub, pending.wrapper());
                BuildData::from_result(&pending.result().await)
            }
            Backend::Workers(pool) => {
                let options = resolve(raw);
                if options.hmr {
                    hub.add_path(&options.hmr_path);
                }
                match pool.build(options).await {
                    Ok(data) => data,
                    Err(e) => BuildData::from_worker_error(&e),
                }
            }
        }
    }

    async fn shutdown(&self) {
        match self {
            Backend::InProcess(context) => context.reset(),
            Backend::Workers(pool) => pool.shutdown().await,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    backend: Arc<Backend>,
    hub: Arc<HmrHub>,
    started: Instant,
}

impl AppState {
    pub fn new(backend: Backend, hub: Arc<HmrHub>) -> Self {
        Self {
            backend: Arc::new(backend),
            hub,
            started: Instant::now(),
        }
    }

    pub fn hub(&self) -> &Arc<HmrHub> {
        &self.hub
    }
}

/// Build the axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_status))
        .route("/build", post(handle_build))
        .route(&format!("{DEFAULT_HMR_PATH}/{{*namespace}}"), get(handle_hmr))
        .fallback(handle_custom_hmr)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the server and run until ctrl-c.
pub async fn serve(config: ServerConfig, worker_flags: Vec<String>) -> Result<()> {
    let hub = Arc::new(HmrHub::new());
    let backend = if config.workers == 0 {
        Backend::InProcess(BuildContext::with_rolldown())
    } else {
        Backend::Workers(WorkerPool::spawn(
            config.workers,
            Arc::clone(&hub),
            worker_flags,
        )?)
    };
    let state = AppState::new(backend, hub);

    let listener = tokio::net::TcpListener::bind((config.address.as_str(), config.port))
        .await
        .map_err(|e| CliError::Server(format!("Failed to bind to {}: {}", config.url(), e)))?;

    ui::success(&format!("Relay listening at {}", config.url()));
    if config.workers > 0 {
        ui::info(&format!("Building in {} worker processes", config.workers));
    }

    let backend = Arc::clone(&state.backend);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CliError::Server(format!("Server error: {}", e)))?;

    backend.shutdown().await;
    ui::info("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // Without a signal handler the server runs until killed.
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn handle_build(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let raw = match serde_json::from_str::<RawOptions>(&body) {
        Ok(raw) => raw,
        Err(e) => {
            let data = BuildData::bad_request(&format!("Invalid build request: {e}"));
            return (StatusCode::BAD_REQUEST, Json(data));
        }
    };

    let started = Instant::now();
    let data = state.backend.build(raw, &state.hub).await;
    debug!(
        ok = data.is_ok(),
        elapsed = %ui::format_duration(started.elapsed()),
        "answered build request"
    );
    (StatusCode::OK, Json(data))
}

async fn handle_hmr(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    hmr_stream(&state.hub, &format!("/{}", namespace.trim_start_matches('/')))
}

/// Event streams under custom `hmrPath` prefixes. Anything else is a 404.
async fn handle_custom_hmr(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.hub.namespace_for(uri.path()) {
        Some(namespace) => hmr_stream(&state.hub, &namespace).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn hmr_stream(
    hub: &HmrHub,
    namespace: &str,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>> + use<>> {
    let mut events = hub.subscribe(namespace);
    debug!(namespace = %namespace, "hmr client connected");

    let (tx, rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if tx.send(event.to_json()).await.is_err() {
                break;
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|data| Ok(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

async fn handle_status(State(state): State<AppState>) -> Html<String> {
    let workers = match state.backend.as_ref() {
        Backend::InProcess(context) => StatusBody::InProcess(context.status()),
        Backend::Workers(pool) => StatusBody::Workers {
            statuses: pool.statuses().await,
            cache_hits: pool.cache_hits(),
        },
    };
    Html(render_status(
        &workers,
        &state.hub,
        state.started.elapsed(),
    ))
}

enum StatusBody {
    InProcess(ContextStatus),
    Workers {
        statuses: Vec<WorkerStatus>,
        cache_hits: u64,
    },
}

fn render_status(body: &StatusBody, hub: &HmrHub, uptime: Duration) -> String {
    let mut html = String::from(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>relay</title></head>\n<body>\n",
    );
    let _ = writeln!(
        html,
        "<h1>relay {}</h1>\n<p>Up for {}</p>",
        env!("CARGO_PKG_VERSION"),
        ui::format_duration(uptime)
    );

    match body {
        StatusBody::InProcess(status) => {
            html.push_str("<h2>Builds (in-process)</h2>\n");
            push_context_table(&mut html, status);
        }
        StatusBody::Workers {
            statuses,
            cache_hits,
        } => {
            let _ = writeln!(
                html,
                "<h2>Workers</h2>\n<p>{} cache hits reported</p>\n<table>\n<tr><th>#</th><th>pid</th><th>state</th><th>pending</th><th>builds</th><th>wrappers</th><th>watching</th></tr>",
                cache_hits
            );
            for worker in statuses {
                let state = match (worker.alive, worker.ready) {
                    (false, _) => "exited",
                    (true, false) => "starting",
                    (true, true) => "ready",
                };
                let (wrappers, watching) = worker
                    .context
                    .as_ref()
                    .map(|c| (c.wrappers.to_string(), c.watching.to_string()))
                    .unwrap_or_else(|| ("-".into(), "-".into()));
                let _ = writeln!(
                    html,
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                    worker.index,
                    worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    state,
                    worker.pending,
                    worker.builds,
                    wrappers,
                    watching
                );
            }
            html.push_str("</table>\n");
        }
    }

    let namespaces = hub.namespaces();
    if !namespaces.is_empty() {
        html.push_str("<h2>HMR</h2>\n<ul>\n");
        for namespace in namespaces {
            let _ = writeln!(
                html,
                "<li>{} ({} clients)</li>",
                escape(&namespace),
                hub.clients(&namespace)
            );
        }
        html.push_str("</ul>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

fn push_context_table(html: &mut String, status: &ContextStatus) {
    let _ = writeln!(
        html,
        "<table>\n<tr><td>wrappers</td><td>{}</td></tr>\n<tr><td>watching</td><td>{}</td></tr>\n<tr><td>caches</td><td>{}</td></tr>\n<tr><td>builds</td><td>{}</td></tr>\n<tr><td>cache hits</td><td>{}</td></tr>\n</table>",
        status.wrappers, status.watching, status.caches, status.builds, status.cache_hits
    );
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
