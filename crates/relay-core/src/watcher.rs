//! Compiler watcher.
//!
//! Wraps a watching compiler and turns its signal stream into a small state
//! machine that callers can wait on:
//!
//! ```text
//! Idle --once_done--> Pending --Done--> Ready --Invalid--> Invalid --Done--> Ready
//!                        \                                    /
//!                         +------------ Failed <-------------+
//! ```
//!
//! Watching starts lazily on the first [`CompilerWatcher::once_done`]. While a
//! compile is in flight every caller is queued, and all of them receive the
//! same [`Completion`] when it lands.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::compiler::{Compiler, Stats};
use crate::error::Error;
use crate::watch::{CompilerSignal, WatchControl, WatchOptions};

/// Outcome of one compile as seen by waiting callers.
///
/// `stats` is present whenever the compiler produced a result, including
/// compiles that reported errors. `error` holds the first compile error, or
/// the fatal error when watching failed.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub error: Option<Error>,
    pub stats: Option<Arc<Stats>>,
}

impl Completion {
    fn failed(error: Error) -> Self {
        Self {
            error: Some(error),
            stats: None,
        }
    }

    fn from_stats(stats: Arc<Stats>) -> Self {
        Self {
            error: stats.errors.first().map(|message| Error::compile(message.clone())),
            stats: Some(stats),
        }
    }
}

/// Event published to subscribers of a watcher.
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    Done(Completion),
    Invalid,
    Failed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherPhase {
    Idle,
    Pending,
    Ready,
    Invalid,
    Failed,
    Closed,
}

struct WatcherState {
    phase: WatcherPhase,
    last: Option<Completion>,
    failure: Option<Error>,
    pending: Vec<oneshot::Sender<Completion>>,
    control: Option<WatchControl>,
}

pub struct CompilerWatcher {
    compiler: Arc<dyn Compiler>,
    options: WatchOptions,
    state: Mutex<WatcherState>,
    events: broadcast::Sender<WatcherEvent>,
}

impl CompilerWatcher {
    /// Create an idle watcher. Events are published on `events`.
    pub fn new(
        compiler: Arc<dyn Compiler>,
        options: WatchOptions,
        events: broadcast::Sender<WatcherEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            compiler,
            options,
            state: Mutex::new(WatcherState {
                phase: WatcherPhase::Idle,
                last: None,
                failure: None,
                pending: Vec::new(),
                control: None,
            }),
            events,
        })
    }

    pub fn phase(&self) -> WatcherPhase {
        self.state.lock().phase
    }

    pub fn is_watching(&self) -> bool {
        matches!(
            self.phase(),
            WatcherPhase::Pending | WatcherPhase::Ready | WatcherPhase::Invalid
        )
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == WatcherPhase::Ready
    }

    pub fn last_stats(&self) -> Option<Arc<Stats>> {
        self.state.lock().last.as_ref().and_then(|c| c.stats.clone())
    }

    pub fn last_error(&self) -> Option<Error> {
        let state = self.state.lock();
        match &state.last {
            Some(completion) => completion.error.clone(),
            None => state.failure.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.events.subscribe()
    }

    /// Wait for the next completed compile.
    ///
    /// Returns immediately when a result is ready. Otherwise the caller is
    /// queued, and the first call starts watching.
    pub async fn once_done(self: &Arc<Self>) -> Completion {
        let rx = {
            let mut state = self.state.lock();
            match state.phase {
                WatcherPhase::Ready => {
                    if let Some(last) = &state.last {
                        return last.clone();
                    }
                }
                WatcherPhase::Failed => {
                    let error = state
                        .failure
                        .clone()
                        .unwrap_or_else(|| Error::WatcherFailed("unknown failure".into()));
                    return Completion::failed(error);
                }
                WatcherPhase::Closed => return Completion::failed(Error::WatcherClosed),
                WatcherPhase::Idle | WatcherPhase::Pending | WatcherPhase::Invalid => {}
            }

            let (tx, rx) = oneshot::channel();
            state.pending.push(tx);
            if state.phase == WatcherPhase::Idle {
                self.start(&mut state);
            }
            rx
        };

        rx.await
            .unwrap_or_else(|_| Completion::failed(Error::WatcherClosed))
    }

    /// Force a rebuild. Callers arriving after this wait for the new result.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        let Some(control) = &state.control else {
            return;
        };
        control.invalidate();
        if state.phase == WatcherPhase::Ready {
            state.phase = WatcherPhase::Invalid;
            state.last = None;
        }
    }

    /// Stop watching. Queued callers receive [`Error::WatcherClosed`].
    pub fn close(&self) {
        let pending = {
            let mut state = self.state.lock();
            if let Some(control) = state.control.take() {
                control.close();
            }
            state.phase = WatcherPhase::Closed;
            state.last = None;
            std::mem::take(&mut state.pending)
        };
        for tx in pending {
            let _ = tx.send(Completion::failed(Error::WatcherClosed));
        }
    }

    fn start(self: &Arc<Self>, state: &mut WatcherState) {
        debug!("starting compiler watch");
        let session = Arc::clone(&self.compiler).watch(self.options);
        state.control = Some(session.control);
        state.phase = WatcherPhase::Pending;
        tokio::spawn(pump(Arc::downgrade(self), session.signals));
    }

    fn handle_done(&self, stats: Arc<Stats>) {
        let completion = Completion::from_stats(stats);
        let pending = {
            let mut state = self.state.lock();
            if matches!(state.phase, WatcherPhase::Closed | WatcherPhase::Failed) {
                return;
            }
            state.phase = WatcherPhase::Ready;
            state.last = Some(completion.clone());
            std::mem::take(&mut state.pending)
        };

        if let Some(error) = &completion.error {
            debug!("compile finished with errors: {}", error);
        }
        let _ = self.events.send(WatcherEvent::Done(completion.clone()));
        for tx in pending {
            let _ = tx.send(completion.clone());
        }
    }

    fn handle_invalid(&self) {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, WatcherPhase::Closed | WatcherPhase::Failed) {
                return;
            }
            state.phase = WatcherPhase::Invalid;
            state.last = None;
        }
        let _ = self.events.send(WatcherEvent::Invalid);
    }

    fn handle_failed(&self, error: Error) {
        warn!("compiler watch failed: {}", error);
        let pending = {
            let mut state = self.state.lock();
            if state.phase == WatcherPhase::Closed {
                return;
            }
            state.phase = WatcherPhase::Failed;
            state.failure = Some(error.clone());
            state.last = None;
            state.control = None;
            std::mem::take(&mut state.pending)
        };

        let _ = self.events.send(WatcherEvent::Failed(error.clone()));
        for tx in pending {
            let _ = tx.send(Completion::failed(error.clone()));
        }
    }
}

impl Drop for CompilerWatcher {
    fn drop(&mut self) {
        if let Some(control) = self.state.get_mut().control.take() {
            control.close();
        }
    }
}

/// Feed compiler signals into the watcher.
///
/// A `Done` is held back for one scheduler tick: when an `Invalid` is already
/// queued behind it, the result is stale and is dropped.
async fn pump(watcher: Weak<CompilerWatcher>, mut signals: mpsc::UnboundedReceiver<CompilerSignal>) {
    let mut backlog: VecDeque<CompilerSignal> = VecDeque::new();

    loop {
        let signal = match backlog.pop_front() {
            Some(signal) => signal,
            None => match signals.recv().await {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(watcher) = watcher.upgrade() else {
            break;
        };

        match signal {
            CompilerSignal::Done(stats) => {
                tokio::task::yield_now().await;
                while let Ok(next) = signals.try_recv() {
                    backlog.push_back(next);
                }
                if backlog.iter().any(|s| matches!(s, CompilerSignal::Invalid)) {
                    debug!("dropping compile result superseded by invalidation");
                    continue;
                }
                watcher.handle_done(stats);
            }
            CompilerSignal::Invalid => watcher.handle_invalid(),
            CompilerSignal::Failed(error) => {
                watcher.handle_failed(error);
                break;
            }
        }
    }
}
