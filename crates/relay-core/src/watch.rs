//! Generic watch loop shared by compilers.
//!
//! The loop compiles, reports `Done`, then watches the parent directories of
//! every file dependency. The first relevant change reports `Invalid`; further
//! changes within `aggregate_timeout` are folded into the same rebuild.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::compiler::{Compiler, Stats};
use crate::error::{Error, Result};
use crate::options::BuildOptions;

/// Timing knobs for a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub aggregate_timeout: Duration,
    /// Use a polling watcher with this interval instead of native events.
    pub poll_interval: Option<Duration>,
}

impl From<&BuildOptions> for WatchOptions {
    fn from(options: &BuildOptions) -> Self {
        Self {
            aggregate_timeout: options.aggregate_timeout,
            poll_interval: options.poll_interval,
        }
    }
}

/// Lifecycle signal emitted by a watching compiler.
#[derive(Debug, Clone)]
pub enum CompilerSignal {
    Done(Arc<Stats>),
    Invalid,
    Failed(Error),
}

/// Command sent to a watching compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchCommand {
    /// Recompile without waiting for a file change.
    Invalidate,
    Close,
}

/// Handle used to steer a watch session.
#[derive(Debug, Clone)]
pub struct WatchControl {
    commands: mpsc::UnboundedSender<WatchCommand>,
}

impl WatchControl {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WatchCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { commands: tx }, rx)
    }

    pub fn invalidate(&self) {
        let _ = self.commands.send(WatchCommand::Invalidate);
    }

    pub fn close(&self) {
        let _ = self.commands.send(WatchCommand::Close);
    }
}

/// A running watch: its signal stream and its control handle.
#[derive(Debug)]
pub struct WatchSession {
    pub signals: mpsc::UnboundedReceiver<CompilerSignal>,
    pub control: WatchControl,
}

/// Watch `compiler` with the default notify-backed loop.
///
/// Must be called inside a tokio runtime.
pub fn spawn_watch_loop(compiler: Arc<dyn Compiler>, options: WatchOptions) -> WatchSession {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (control, commands) = WatchControl::channel();

    tokio::spawn(run_watch_loop(compiler, options, signal_tx, commands));

    WatchSession {
        signals: signal_rx,
        control,
    }
}

async fn run_watch_loop(
    compiler: Arc<dyn Compiler>,
    options: WatchOptions,
    signals: mpsc::UnboundedSender<CompilerSignal>,
    mut commands: mpsc::UnboundedReceiver<WatchCommand>,
) {
    let (change_tx, mut changes) = mpsc::unbounded_channel::<PathBuf>();
    let mut _watcher: Option<DependencyWatcher> = None;

    loop {
        let stats = match compiler.run().await {
            Ok(stats) => Arc::new(stats),
            Err(e) => {
                let _ = signals.send(CompilerSignal::Failed(e));
                return;
            }
        };

        match DependencyWatcher::new(&stats.file_dependencies, options, change_tx.clone()) {
            Ok(watcher) => _watcher = Some(watcher),
            Err(e) => {
                let _ = signals.send(CompilerSignal::Failed(e));
                return;
            }
        }

        if signals.send(CompilerSignal::Done(stats)).is_err() {
            return;
        }

        tokio::select! {
            Some(path) = changes.recv() => {
                debug!(path = %path.display(), "file dependency changed");
            }
            command = commands.recv() => match command {
                Some(WatchCommand::Invalidate) => debug!("watch invalidated"),
                Some(WatchCommand::Close) | None => return,
            },
        }

        if signals.send(CompilerSignal::Invalid).is_err() {
            return;
        }

        // Fold bursts of changes into one rebuild.
        loop {
            tokio::select! {
                Some(_) = changes.recv() => continue,
                command = commands.recv() => match command {
                    Some(WatchCommand::Invalidate) => continue,
                    Some(WatchCommand::Close) | None => return,
                },
                _ = tokio::time::sleep(options.aggregate_timeout) => break,
            }
        }
    }
}

/// Notify watcher over the directories holding a set of files.
///
/// Only create, modify and remove events for the files themselves are
/// forwarded.
struct DependencyWatcher {
    _watcher: Box<dyn Watcher + Send>,
}

impl DependencyWatcher {
    fn new(
        files: &[PathBuf],
        options: WatchOptions,
        tx: mpsc::UnboundedSender<PathBuf>,
    ) -> Result<Self> {
        let watched: HashSet<PathBuf> = files.iter().cloned().collect();
        let dirs: BTreeSet<PathBuf> = files
            .iter()
            .filter_map(|file| file.parent().map(PathBuf::from))
            .collect();

        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in event.paths {
                    if watched.contains(&path) {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => warn!("file watch error: {}", e),
        };

        let mut watcher: Box<dyn Watcher + Send> = match options.poll_interval {
            Some(interval) => Box::new(PollWatcher::new(
                handler,
                notify::Config::default().with_poll_interval(interval),
            )?),
            None => Box::new(notify::recommended_watcher(handler)?),
        };

        for dir in &dirs {
            if !dir.exists() {
                continue;
            }
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct CountingCompiler {
        runs: AtomicUsize,
        deps: Vec<PathBuf>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Compiler for CountingCompiler {
        async fn run(&self) -> Result<Stats> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(run) {
                return Err(Error::WatcherFailed("compiler crashed".into()));
            }
            Ok(Stats {
                hash: format!("run-{run}"),
                file_dependencies: self.deps.clone(),
                ..Default::default()
            })
        }

        fn watch(self: Arc<Self>, options: WatchOptions) -> WatchSession {
            spawn_watch_loop(self, options)
        }
    }

    fn options() -> WatchOptions {
        WatchOptions {
            aggregate_timeout: Duration::from_millis(20),
            poll_interval: None,
        }
    }

    async fn next(session: &mut WatchSession) -> CompilerSignal {
        tokio::time::timeout(Duration::from_secs(10), session.signals.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("watch loop ended")
    }

    #[tokio::test]
    async fn test_invalidate_triggers_rebuild() {
        let compiler = Arc::new(CountingCompiler {
            runs: AtomicUsize::new(0),
            deps: Vec::new(),
            fail_on: None,
        });
        let mut session = Arc::clone(&compiler).watch(options());

        assert!(matches!(next(&mut session).await, CompilerSignal::Done(s) if s.hash == "run-1"));

        session.control.invalidate();
        assert!(matches!(next(&mut session).await, CompilerSignal::Invalid));
        assert!(matches!(next(&mut session).await, CompilerSignal::Done(s) if s.hash == "run-2"));

        session.control.close();
    }

    #[tokio::test]
    async fn test_compiler_error_fails_session() {
        let compiler = Arc::new(CountingCompiler {
            runs: AtomicUsize::new(0),
            deps: Vec::new(),
            fail_on: Some(2),
        });
        let mut session = Arc::clone(&compiler).watch(options());

        assert!(matches!(next(&mut session).await, CompilerSignal::Done(_)));
        session.control.invalidate();
        assert!(matches!(next(&mut session).await, CompilerSignal::Invalid));
        assert!(matches!(next(&mut session).await, CompilerSignal::Failed(_)));
    }

    #[tokio::test]
    async fn test_file_change_triggers_rebuild() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("entry.js");
        std::fs::write(&file, "export default 1;").unwrap();

        let compiler = Arc::new(CountingCompiler {
            runs: AtomicUsize::new(0),
            deps: vec![file.clone()],
            fail_on: None,
        });
        let mut session = Arc::clone(&compiler).watch(WatchOptions {
            aggregate_timeout: Duration::from_millis(20),
            poll_interval: Some(Duration::from_millis(25)),
        });

        assert!(matches!(next(&mut session).await, CompilerSignal::Done(_)));

        // Poll watchers compare modification times; give the first scan a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&file, "export default 2; // changed").unwrap();

        assert!(matches!(next(&mut session).await, CompilerSignal::Invalid));
        assert!(matches!(next(&mut session).await, CompilerSignal::Done(s) if s.hash == "run-2"));
        session.control.close();
    }
}
