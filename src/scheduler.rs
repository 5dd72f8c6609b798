// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Token-bucket task scheduler gating outbound calls.
//!
//! The [`TokenBucketScheduler`] is the single admission gate for upstream
//! requests. It enforces three limits at once:
//!
//! ```text
//! schedule() ──┬─ destroyed?        → reject (Destroyed)
//!              ├─ circuit open?     → reject (CircuitOpen), never enqueued
//!              └─ enqueue ──► FIFO queue
//!                               │
//!                          drain loop: admit while
//!                            active  < max_concurrent
//!                            tokens  > 0
//!                               │
//!                          spawn task ──► settle: slot freed, drain again
//!
//! tick() every interval: tokens = max_per_interval (absolute reset)
//! ```
//!
//! Tokens are **not** refunded when a task settles; only the concurrency
//! slot is. The periodic refill resets the bucket to its full quota rather
//! than accumulating. Admission is strict FIFO relative to `schedule()`
//! order; one task's failure reaches only its own caller.
//!
//! The refill is exposed as an explicit [`tick`](TokenBucketScheduler::tick)
//! so tests can drive time deterministically; production wiring runs a
//! tokio interval task that calls it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

/// Minimum refill interval; anything shorter is clamped up.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Caller-supplied circuit-breaker predicate. Returning `true` means the
/// circuit is open and new work must be rejected before admission.
pub type CircuitBreakerCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Error type for scheduled tasks.
#[derive(Debug, Error)]
pub enum ScheduleError<E> {
    /// The scheduler was destroyed before (or while) this task could run.
    #[error("scheduler has been destroyed")]
    Destroyed,

    /// The circuit breaker rejected the task before it entered the queue.
    /// The scheduler never retries this; retry policy belongs to the caller.
    #[error("circuit breaker is open, rejecting request")]
    CircuitOpen,

    /// The task itself failed. Propagated verbatim to the one caller that
    /// scheduled it.
    #[error("task failed: {0}")]
    Task(#[source] E),
}

/// Configuration for a [`TokenBucketScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum tasks executing at once (clamped to ≥ 1).
    pub max_concurrent: usize,
    /// Tokens granted per refill interval (clamped to ≥ 1).
    pub max_per_interval: usize,
    /// Refill interval (clamped to ≥ [`MIN_INTERVAL`]).
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_per_interval: 12,
            interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Clamp all fields to their documented lower bounds.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.max(1);
        self.max_per_interval = self.max_per_interval.max(1);
        self.interval = self.interval.max(MIN_INTERVAL);
        self
    }

    /// Long refill interval so tests drive `tick()` themselves.
    #[cfg(test)]
    pub fn manual() -> Self {
        Self {
            max_concurrent: 4,
            max_per_interval: 12,
            interval: Duration::from_secs(3600),
        }
    }
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// Tasks accepted into the queue.
    pub scheduled: u64,
    /// Tasks that ran to settlement (success or failure).
    pub completed: u64,
    /// Tasks rejected before execution (destroyed or circuit open).
    pub rejected: u64,
    /// Currently executing tasks.
    pub active: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tokens remaining in the current interval.
    pub tokens: usize,
}

/// A queued unit of work, erased to run-and-deliver / cancel closures.
struct QueuedTask {
    run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
    cancel: Box<dyn FnOnce() + Send>,
    label: Option<String>,
}

struct State {
    tokens: usize,
    active: usize,
    queue: VecDeque<QueuedTask>,
    destroyed: bool,
}

struct Inner {
    config: SchedulerConfig,
    circuit_breaker: Option<CircuitBreakerCheck>,
    state: Mutex<State>,
    scheduled: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Rate-limited, concurrency-capped, circuit-breakable FIFO scheduler.
///
/// Cheap to clone; clones share the same queue and counters. Owned by the
/// pipeline's composition root and passed by reference to collaborators,
/// living exactly one pipeline run.
#[derive(Clone)]
pub struct TokenBucketScheduler {
    inner: Arc<Inner>,
}

impl TokenBucketScheduler {
    /// Create a scheduler with an always-closed circuit breaker.
    ///
    /// Must be called within a tokio runtime: the refill ticker is spawned
    /// here and aborted by [`destroy`](Self::destroy) (or on drop of the
    /// last clone).
    pub fn new(config: SchedulerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a scheduler with a circuit-breaker predicate, checked once
    /// per `schedule()` call before the task enters the queue.
    pub fn with_breaker(config: SchedulerConfig, check: CircuitBreakerCheck) -> Self {
        Self::build(config, Some(check))
    }

    /// Construct a fresh scheduler with this scheduler's config and a new
    /// circuit-breaker predicate. The current instance is untouched; the
    /// caller decides when to [`destroy`](Self::destroy) it.
    #[must_use]
    pub fn with_circuit_breaker(&self, check: CircuitBreakerCheck) -> Self {
        Self::build(self.inner.config.clone(), Some(check))
    }

    fn build(config: SchedulerConfig, circuit_breaker: Option<CircuitBreakerCheck>) -> Self {
        let config = config.clamped();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                tokens: config.max_per_interval,
                active: 0,
                queue: VecDeque::new(),
                destroyed: false,
            }),
            circuit_breaker,
            scheduled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            ticker: Mutex::new(None),
            config,
        });

        let period = inner.config.interval;
        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First interval tick fires immediately; skip it so the initial
            // bucket lasts a full interval.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                refill(&inner);
            }
        });
        *inner.ticker.lock() = Some(handle);

        debug!(
            max_concurrent = inner.config.max_concurrent,
            max_per_interval = inner.config.max_per_interval,
            interval_ms = inner.config.interval.as_millis() as u64,
            "Scheduler created"
        );
        Self { inner }
    }

    /// Schedule a task, awaiting its result.
    ///
    /// The task future does not start executing until admitted by the drain
    /// loop; admission is strict FIFO.
    pub async fn schedule<T, E, Fut>(&self, task: Fut) -> Result<T, ScheduleError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.schedule_inner(None, task).await
    }

    /// Schedule a task with a label used in scheduler logging.
    pub async fn schedule_labeled<T, E, Fut>(
        &self,
        label: &str,
        task: Fut,
    ) -> Result<T, ScheduleError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.schedule_inner(Some(label.to_string()), task).await
    }

    async fn schedule_inner<T, E, Fut>(
        &self,
        label: Option<String>,
        task: Fut,
    ) -> Result<T, ScheduleError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if self.inner.state.lock().destroyed {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_task_rejected("destroyed");
            return Err(ScheduleError::Destroyed);
        }

        if let Some(check) = &self.inner.circuit_breaker {
            if check() {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::record_task_rejected("circuit_open");
                warn!(label = label.as_deref(), "Circuit breaker open, rejecting request");
                return Err(ScheduleError::CircuitOpen);
            }
        }

        let (tx, rx) = oneshot::channel::<Result<T, ScheduleError<E>>>();
        // Either the run path or the cancel path delivers, never both.
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_run = Arc::clone(&tx);

        let queued = QueuedTask {
            run: Box::new(move || {
                async move {
                    let result = task.await;
                    if let Some(tx) = tx_run.lock().take() {
                        let _ = tx.send(result.map_err(ScheduleError::Task));
                    }
                }
                .boxed()
            }),
            cancel: Box::new(move || {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Err(ScheduleError::Destroyed));
                }
            }),
            label,
        };

        {
            let mut state = self.inner.state.lock();
            // Re-check under the lock: destroy() may have run since the
            // fast check above.
            if state.destroyed {
                drop(state);
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(ScheduleError::Destroyed);
            }
            state.queue.push_back(queued);
            metrics::set_queue_depth(state.queue.len());
        }
        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        drain(&self.inner);

        match rx.await {
            Ok(result) => result,
            // Sender dropped without delivering: scheduler torn down.
            Err(_) => Err(ScheduleError::Destroyed),
        }
    }

    /// Refill the token bucket to its full quota (absolute reset, not
    /// additive) and drain the queue. Called by the interval ticker in
    /// production; tests may call it directly.
    pub fn tick(&self) {
        refill(&self.inner);
    }

    /// Tear the scheduler down. Idempotent.
    ///
    /// Stops the refill ticker, rejects every still-queued task with
    /// [`ScheduleError::Destroyed`], and makes subsequent `schedule()`
    /// calls reject immediately. Already-executing tasks are not cancelled.
    pub fn destroy(&self) {
        let drained: Vec<QueuedTask> = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.queue.drain(..).collect()
        };

        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
        }

        let rejected = drained.len();
        for task in drained {
            (task.cancel)();
        }
        self.inner
            .rejected
            .fetch_add(rejected as u64, Ordering::Relaxed);
        metrics::set_queue_depth(0);
        info!(rejected_queued = rejected, "Scheduler destroyed");
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            scheduled: self.inner.scheduled.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            active: state.active,
            queued: state.queue.len(),
            tokens: state.tokens,
        }
    }

    /// The (clamped) config this scheduler runs with.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

fn refill(inner: &Arc<Inner>) {
    {
        let mut state = inner.state.lock();
        if state.destroyed {
            return;
        }
        state.tokens = inner.config.max_per_interval;
    }
    drain(inner);
}

/// Admit queued tasks while a concurrency slot and a token are available.
/// Safe to call from any path; all admission state sits behind one mutex.
fn drain(inner: &Arc<Inner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            if state.destroyed
                || state.queue.is_empty()
                || state.active >= inner.config.max_concurrent
                || state.tokens == 0
            {
                break;
            }
            state.tokens -= 1;
            state.active += 1;
            metrics::set_queue_depth(state.queue.len() - 1);
            state.queue.pop_front()
        };

        let Some(task) = task else { break };
        metrics::record_task_admitted();
        if let Some(label) = &task.label {
            debug!(label = %label, "Task admitted");
        }

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            (task.run)().await;
            {
                let mut state = inner.state.lock();
                state.active -= 1;
            }
            inner.completed.fetch_add(1, Ordering::Relaxed);
            drain(&inner);
        });
    }
}
