// ============================================================================
// Sync Coordinator
// ============================================================================
//
// One state per session key:
//
//   Idle --activity--> Pending(timer) --timer fires--> Committing --done--> Idle
//                        ^   |                             |
//                        +---+ activity restarts timer     | activity while
//                                                          | committing is
//   Committing --done, activity queued--> Pending <--------+ queued
//
// Idle keys are not stored. Timers are tokio tasks; a generation number
// tags each timer so a fire that lost a race with a restart is dropped.
//
// ============================================================================

use crate::capture::{CaptureReport, ChangeCapture, DocumentSource};
use crate::core::{HotCloseError, Result, SessionKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{Level, event};

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Observable phase of a session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pending,
    Committing,
}

enum Phase {
    Pending { timer: JoinHandle<()> },
    /// `queued` holds the delay of a follow-up window requested mid-commit.
    Committing { queued: Option<Duration> },
}

struct KeyState {
    generation: u64,
    phase: Phase,
    source: Arc<dyn DocumentSource>,
    /// Callers of `capture_now` waiting on the next commit of this key.
    waiters: Vec<oneshot::Sender<CaptureReport>>,
}

struct Inner {
    capture: Arc<ChangeCapture>,
    default_delay: Duration,
    enabled: bool,
    keys: Mutex<HashMap<SessionKey, KeyState>>,
    generations: AtomicU64,
    reports: broadcast::Sender<CaptureReport>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(capture: Arc<ChangeCapture>, default_delay: Duration, enabled: bool) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                capture,
                default_delay,
                enabled,
                keys: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                reports,
            }),
        }
    }

    /// Register activity on a document. Restarts its debounce window; only
    /// the last window of a burst fires.
    pub fn schedule(&self, source: Arc<dyn DocumentSource>, delay: Option<Duration>) {
        if !self.inner.enabled {
            return;
        }
        let delay = delay.unwrap_or(self.inner.default_delay);
        let key = source.session_key();
        let mut keys = self.inner.keys();

        match keys.get_mut(&key) {
            Some(state) => {
                state.source = source;
                match &mut state.phase {
                    Phase::Pending { timer } => {
                        timer.abort();
                        state.generation = self.inner.next_generation();
                        let timer = self.inner.spawn_timer(key.clone(), state.generation, delay);
                        state.phase = Phase::Pending { timer };
                    }
                    Phase::Committing { queued } => {
                        // An immediate capture waiting on this commit keeps its zero delay.
                        *queued = Some(queued.map_or(delay, |current| current.min(delay)));
                    }
                }
            }
            None => {
                let generation = self.inner.next_generation();
                let timer = self.inner.spawn_timer(key.clone(), generation, delay);
                keys.insert(
                    key,
                    KeyState {
                        generation,
                        phase: Phase::Pending { timer },
                        source,
                        waiters: Vec::new(),
                    },
                );
            }
        }
    }

    /// Commit `source` immediately, superseding any pending window.
    ///
    /// If a commit for the same key is already running, this waits for a
    /// follow-up commit instead of starting a second one alongside it.
    pub async fn capture_now(&self, source: Arc<dyn DocumentSource>) -> Result<CaptureReport> {
        let key = source.session_key();
        let waiter = {
            let mut keys = self.inner.keys();
            match keys.get_mut(&key) {
                Some(state) => {
                    state.source = source;
                    match &mut state.phase {
                        Phase::Committing { queued } => {
                            *queued = Some(Duration::ZERO);
                            let (tx, rx) = oneshot::channel();
                            state.waiters.push(tx);
                            Some(rx)
                        }
                        Phase::Pending { timer } => {
                            timer.abort();
                            state.generation = self.inner.next_generation();
                            state.phase = Phase::Committing { queued: None };
                            None
                        }
                    }
                }
                None => {
                    keys.insert(
                        key.clone(),
                        KeyState {
                            generation: self.inner.next_generation(),
                            phase: Phase::Committing { queued: None },
                            source,
                            waiters: Vec::new(),
                        },
                    );
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx.await.map_err(|_| HotCloseError::Cancelled(key.to_string()));
        }

        let (source, waiters) = self.inner.take_for_commit(&key)?;
        // Run detached so a dropped caller cannot strand the key in Committing.
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.commit(key, source, waiters).await })
            .await
            .map_err(|e| HotCloseError::Lock(format!("capture task failed: {}", e)))
    }

    /// Drop the pending window for `key`, or the follow-up queued behind a
    /// running commit. A commit already running is left to finish.
    /// Returns whether anything was cancelled.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        let mut keys = self.inner.keys();
        let cancelled = match keys.get_mut(key) {
            Some(state) => match &mut state.phase {
                Phase::Pending { timer } => {
                    timer.abort();
                    keys.remove(key);
                    true
                }
                Phase::Committing { queued } => {
                    // Dropping the senders wakes any capture_now callers.
                    state.waiters.clear();
                    queued.take().is_some()
                }
            },
            None => false,
        };
        if cancelled {
            event!(Level::DEBUG, session = %key, "pending capture cancelled");
        }
        cancelled
    }

    /// Cancel every pending window.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<SessionKey> = self.inner.keys().keys().cloned().collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    pub fn phase(&self, key: &SessionKey) -> SyncPhase {
        match self.inner.keys().get(key).map(|state| &state.phase) {
            None => SyncPhase::Idle,
            Some(Phase::Pending { .. }) => SyncPhase::Pending,
            Some(Phase::Committing { .. }) => SyncPhase::Committing,
        }
    }

    /// Number of keys that are not idle.
    pub fn active_keys(&self) -> usize {
        self.inner.keys().len()
    }

    /// Reports of every debounced and immediate capture, in completion order.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureReport> {
        self.inner.reports.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }
}

impl Inner {
    fn keys(&self) -> MutexGuard<'_, HashMap<SessionKey, KeyState>> {
        // Every update is a single insert, remove or assignment.
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn spawn_timer(self: &Arc<Self>, key: SessionKey, generation: u64, delay: Duration) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(key, generation).await;
        })
    }

    async fn fire(self: Arc<Self>, key: SessionKey, generation: u64) {
        let claimed = {
            let mut keys = self.keys();
            match keys.get_mut(&key) {
                Some(state)
                    if state.generation == generation
                        && matches!(state.phase, Phase::Pending { .. }) =>
                {
                    // Replacing the phase drops our own JoinHandle, which
                    // detaches rather than aborts.
                    state.phase = Phase::Committing { queued: None };
                    Some((state.source.clone(), std::mem::take(&mut state.waiters)))
                }
                _ => None,
            }
        };

        if let Some((source, waiters)) = claimed {
            self.commit(key, source, waiters).await;
        }
    }

    fn take_for_commit(
        &self,
        key: &SessionKey,
    ) -> Result<(Arc<dyn DocumentSource>, Vec<oneshot::Sender<CaptureReport>>)> {
        let mut keys = self.keys();
        let state = keys
            .get_mut(key)
            .ok_or_else(|| HotCloseError::Cancelled(key.to_string()))?;
        Ok((state.source.clone(), std::mem::take(&mut state.waiters)))
    }

    async fn commit(
        self: Arc<Self>,
        key: SessionKey,
        source: Arc<dyn DocumentSource>,
        waiters: Vec<oneshot::Sender<CaptureReport>>,
    ) -> CaptureReport {
        // Snapshot before the first await; later edits belong to the next window.
        let snapshot = source.snapshot();
        let report = self.capture.capture(snapshot).await;

        for waiter in waiters {
            let _ = waiter.send(report.clone());
        }
        let _ = self.reports.send(report.clone());

        self.finish(&key);
        report
    }

    fn finish(self: &Arc<Self>, key: &SessionKey) {
        let mut keys = self.keys();
        let queued = match keys.get(key).map(|state| &state.phase) {
            Some(Phase::Committing { queued }) => *queued,
            _ => None,
        };

        match queued {
            Some(delay) => {
                let generation = self.next_generation();
                let timer = self.spawn_timer(key.clone(), generation, delay);
                if let Some(state) = keys.get_mut(key) {
                    state.generation = generation;
                    state.phase = Phase::Pending { timer };
                }
            }
            None => {
                keys.remove(key);
            }
        }
    }
}
