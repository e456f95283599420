//! Worker processes.
//!
//! The server can offload builds to child processes (`relay worker`). Each
//! child runs its own [`BuildContext`] and talks to the parent with
//! newline-delimited JSON over stdio (see [`crate::protocol`]).
//!
//! Requests for the same build hash stick to the worker that first served
//! them, so its warm watcher and loaded config get reused. New build hashes
//! go to the live worker with the fewest requests in flight. When a worker
//! dies every request it still owes is failed with
//! [`WorkerError::Exited`]; the worker is not restarted and the requests are
//! not retried elsewhere.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use relay_core::{BuildContext, BuildOptions, BuildWrapper, ContextStatus, Served};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{CliError, Result, WorkerError};
use crate::hmr::{HmrEvent, HmrHub, forward_events};
use crate::protocol::{BuildData, ParentMessage, WorkerMessage};
use crate::ui;

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// A worker's answer to one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Build { build_hash: String, data: BuildData },
    Status(ContextStatus),
}

type ReplySender = oneshot::Sender<std::result::Result<Reply, WorkerError>>;

/// Requests sent to one worker that have not been answered yet.
#[derive(Default)]
pub struct PendingRequests {
    next_id: u64,
    requests: HashMap<u64, ReplySender>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return its id and the reply receiver.
    pub fn insert(
        &mut self,
    ) -> (u64, oneshot::Receiver<std::result::Result<Reply, WorkerError>>) {
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.requests.insert(self.next_id, tx);
        (self.next_id, rx)
    }

    /// Deliver a reply. Returns `false` for unknown ids.
    pub fn resolve(&mut self, id: u64, reply: Reply) -> bool {
        match self.requests.remove(&id) {
            Some(tx) => {
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    pub fn fail(&mut self, id: u64, error: WorkerError) -> bool {
        match self.requests.remove(&id) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request. Returns how many were failed.
    pub fn fail_all(&mut self, error: impl Fn() -> WorkerError) -> usize {
        let failed = self.requests.len();
        for (_, tx) in self.requests.drain() {
            let _ = tx.send(Err(error()));
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Pick the worker for a request.
///
/// `loads[i]` is the number of in-flight requests of worker `i`, or `None`
/// when it is dead. A live sticky worker wins; otherwise the least loaded
/// live worker, lowest index first.
pub fn pick_worker(sticky: Option<usize>, loads: &[Option<usize>]) -> Option<usize> {
    let sticky = sticky.filter(|&index| loads.get(index).is_some_and(|load| load.is_some()));
    if sticky.is_some() {
        return sticky;
    }

    loads
        .iter()
        .enumerate()
        .filter_map(|(index, load)| load.map(|load| (index, load)))
        .min_by_key(|&(index, load)| (load, index))
        .map(|(index, _)| index)
}

/// Parent-side handle to one worker process.
struct Worker {
    index: usize,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pending: Mutex<PendingRequests>,
    alive: AtomicBool,
    ready: AtomicBool,
    builds: AtomicU64,
}

impl Worker {
    fn load(&self) -> Option<usize> {
        let pending = self.pending.lock();
        self.alive
            .load(Ordering::SeqCst)
            .then(|| pending.len())
    }

    async fn request(
        &self,
        message: impl FnOnce(u64) -> ParentMessage,
    ) -> std::result::Result<oneshot::Receiver<std::result::Result<Reply, WorkerError>>, WorkerError>
    {
        let (id, rx) = {
            let mut pending = self.pending.lock();
            if !self.alive.load(Ordering::SeqCst) {
                return Err(WorkerError::Exited { index: self.index });
            }
            pending.insert()
        };

        let line = encode_line(&message(id)).map_err(|e| WorkerError::Transport {
            index: self.index,
            message: e.to_string(),
        })?;

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            let error = WorkerError::Transport {
                index: self.index,
                message: e.to_string(),
            };
            self.pending.lock().fail(id, error.clone());
            return Err(error);
        }
        Ok(rx)
    }

    /// Called once the worker's stdout closes.
    fn mark_dead(&self) {
        let failed = {
            let mut pending = self.pending.lock();
            self.alive.store(false, Ordering::SeqCst);
            pending.fail_all(|| WorkerError::Exited { index: self.index })
        };
        warn!(
            worker = self.index,
            pid = ?self.pid,
            failed,
            "worker exited, failing its pending requests"
        );
        ui::warning(&format!(
            "Worker {} exited; it will not be restarted",
            self.index
        ));
    }
}

/// Status of one worker for the status page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub index: usize,
    pub pid: Option<u32>,
    pub alive: bool,
    pub ready: bool,
    pub pending: usize,
    pub builds: u64,
    pub context: Option<ContextStatus>,
}

/// Fixed-size pool of worker processes.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    affinity: DashMap<String, usize>,
    cache_hits: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawn `count` copies of the current executable in worker mode.
    /// `flags` are passed through (logging flags).
    pub fn spawn(count: usize, hub: Arc<HmrHub>, flags: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe()?;
        let cache_hits = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let worker = spawn_worker(
                index,
                &program,
                &flags,
                Arc::clone(&hub),
                Arc::clone(&cache_hits),
            )?;
            workers.push(worker);
        }

        info!(count, "spawned worker processes");
        Ok(Self {
            workers,
            affinity: DashMap::new(),
            cache_hits,
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn live(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.alive.load(Ordering::SeqCst))
            .count()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    fn select(&self, build_hash: &str) -> std::result::Result<Arc<Worker>, WorkerError> {
        let loads: Vec<Option<usize>> = self.workers.iter().map(|w| w.load()).collect();
        let sticky = self.affinity.get(build_hash).map(|index| *index);

        let index = pick_worker(sticky, &loads).ok_or(WorkerError::NoWorkers)?;
        if sticky != Some(index) {
            debug!(build_hash, worker = index, "assigned build to worker");
            self.affinity.insert(build_hash.to_string(), index);
        }
        Ok(Arc::clone(&self.workers[index]))
    }

    /// Run a build on a worker.
    pub async fn build(&self, options: BuildOptions) -> std::result::Result<BuildData, WorkerError> {
        let worker = self.select(&options.build_hash)?;
        let index = worker.index;
        worker.builds.fetch_add(1, Ordering::Relaxed);

        let rx = worker
            .request(move |id| ParentMessage::Build { id, options })
            .await?;

        match rx.await {
            Ok(Ok(Reply::Build { data, .. })) => Ok(data),
            Ok(Ok(other)) => Err(WorkerError::Protocol {
                index,
                message: format!("expected a build reply, got {other:?}"),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WorkerError::Exited { index }),
        }
    }

    /// Status of every worker. Dead or slow workers report no context.
    pub async fn statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let context = match worker.request(|id| ParentMessage::Status { id }).await {
                Ok(rx) => match tokio::time::timeout(STATUS_TIMEOUT, rx).await {
                    Ok(Ok(Ok(Reply::Status(status)))) => Some(status),
                    _ => None,
                },
                Err(_) => None,
            };
            statuses.push(WorkerStatus {
                index: worker.index,
                pid: worker.pid,
                alive: worker.alive.load(Ordering::SeqCst),
                ready: worker.ready.load(Ordering::SeqCst),
                pending: worker.pending.lock().len(),
                builds: worker.builds.load(Ordering::Relaxed),
                context,
            });
        }
        statuses
    }

    /// Kill every worker process.
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            if let Err(e) = worker.child.lock().await.kill().await {
                debug!(worker = worker.index, "failed to kill worker: {}", e);
            }
        }
    }
}

fn spawn_worker(
    index: usize,
    program: &Path,
    flags: &[String],
    hub: Arc<HmrHub>,
    cache_hits: Arc<AtomicU64>,
) -> Result<Arc<Worker>> {
    let mut child = Command::new(program)
        .arg("worker")
        .args(flags)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| CliError::Custom(format!("worker {index} has no stdin")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CliError::Custom(format!("worker {index} has no stdout")))?;

    let worker = Arc::new(Worker {
        index,
        pid: child.id(),
        stdin: tokio::sync::Mutex::new(stdin),
        child: tokio::sync::Mutex::new(child),
        pending: Mutex::new(PendingRequests::new()),
        alive: AtomicBool::new(true),
        ready: AtomicBool::new(false),
        builds: AtomicU64::new(0),
    });

    tokio::spawn(read_replies(Arc::clone(&worker), stdout, hub, cache_hits));
    Ok(worker)
}

async fn read_replies(
    worker: Arc<Worker>,
    stdout: ChildStdout,
    hub: Arc<HmrHub>,
    cache_hits: Arc<AtomicU64>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(worker = worker.index, "failed to read from worker: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(worker = worker.index, "ignoring malformed worker message: {}", e);
                continue;
            }
        };

        match message {
            WorkerMessage::Ready { pid } => {
                worker.ready.store(true, Ordering::SeqCst);
                debug!(worker = worker.index, pid, "worker ready");
            }
            WorkerMessage::Build {
                id,
                build_hash,
                build_data,
            } => {
                let reply = Reply::Build {
                    build_hash,
                    data: build_data,
                };
                if !worker.pending.lock().resolve(id, reply) {
                    debug!(worker = worker.index, id, "reply for unknown request");
                }
            }
            WorkerMessage::Status { id, status } => {
                worker.pending.lock().resolve(id, Reply::Status(status));
            }
            WorkerMessage::Cache { build_hash } => {
                cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(worker = worker.index, build_hash = %build_hash, "worker served build from cache");
            }
            WorkerMessage::HmrRegister { namespace } => {
                hub.register(&namespace);
            }
            WorkerMessage::HmrDone { namespace, payload } => {
                hub.publish(&namespace, payload);
            }
            WorkerMessage::HmrInvalid { namespace } => {
                hub.publish(&namespace, HmrEvent::Invalid);
            }
        }
    }

    worker.mark_dead();
}

fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Entry point of `relay worker`: serve requests from stdin until it closes.
pub async fn run_worker() -> Result<()> {
    let context = BuildContext::with_rolldown();
    let registered: Arc<DashSet<String>> = Arc::new(DashSet::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_messages(rx));

    let _ = tx.send(WorkerMessage::Ready {
        pid: std::process::id(),
    });
    debug!(pid = std::process::id(), "worker started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ParentMessage>(&line) {
            Ok(ParentMessage::Build { id, options }) => {
                tokio::spawn(handle_build(
                    context.clone(),
                    tx.clone(),
                    Arc::clone(&registered),
                    id,
                    options,
                ));
            }
            Ok(ParentMessage::Status { id }) => {
                let _ = tx.send(WorkerMessage::Status {
                    id,
                    status: context.status(),
                });
            }
            Err(e) => warn!("ignoring malformed request: {}", e),
        }
    }

    debug!("stdin closed, worker shutting down");
    context.reset();
    drop(tx);
    // HMR forwarders hold senders until their wrapper goes away.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    Ok(())
}

async fn handle_build(
    context: BuildContext,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    registered: Arc<DashSet<String>>,
    id: u64,
    options: BuildOptions,
) {
    let build_hash = options.build_hash.clone();
    let pending = context.build_resolved(options);
    forward_hmr(pending.wrapper(), &tx, &registered);

    let outcome = pending.outcome().await;
    if outcome.served == Served::Cache {
        let _ = tx.send(WorkerMessage::Cache {
            build_hash: build_hash.clone(),
        });
    }
    let _ = tx.send(WorkerMessage::Build {
        id,
        build_hash,
        build_data: BuildData::from_result(&outcome.result),
    });
}

/// Relay a wrapper's watcher events to the parent, once per namespace.
fn forward_hmr(
    wrapper: &Arc<BuildWrapper>,
    tx: &mpsc::UnboundedSender<WorkerMessage>,
    registered: &DashSet<String>,
) {
    let options = wrapper.options();
    if !options.hmr || !registered.insert(options.hmr_namespace.clone()) {
        return;
    }

    let namespace = options.hmr_namespace.clone();
    let _ = tx.send(WorkerMessage::HmrRegister {
        namespace: namespace.clone(),
    });

    let events = wrapper.subscribe();
    let tx = tx.clone();
    tokio::spawn(async move {
        forward_events(events, |event| {
            let message = match event {
                HmrEvent::Invalid => WorkerMessage::HmrInvalid {
                    namespace: namespace.clone(),
                },
                payload => WorkerMessage::HmrDone {
                    namespace: namespace.clone(),
                    payload,
                },
            };
            let _ = tx.send(message);
        })
        .await;
    });
}

async fn write_messages(mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = rx.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode worker message: {}", e);
                continue;
            }
        };
        let written = match stdout.write_all(line.as_bytes()).await {
            Ok(()) => stdout.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("failed to write to parent: {}", e);
            break;
        }
    }
}
