//! Bounded worker pool that runs blocking engine calls off the caller's thread.
//!
//! A [`Bridge`] owns a fixed number of worker threads fed from one FIFO queue.
//! [`Bridge::submit`] enqueues a work unit and waits for its result for at most
//! the given timeout, measured from submission. A unit that times out is not
//! interrupted: if a worker already runs it, it runs to completion and its
//! result is discarded. A unit still queued when its caller gives up is
//! skipped by the worker that dequeues it.
//!
//! [`Bridge::submit_exclusive`] tags a unit with a container name. Workers
//! take the oldest queued unit whose name is free, so units for one name run
//! one at a time in submission order while a busy name never ties up a
//! worker.
//!
//! Lifecycle: `Active` on construction, `Draining` once [`Bridge::shutdown`]
//! starts, `Stopped` when the drain finishes. Transitions never go back.

use crate::concurrency::{NameGuard, NameLocks};
use crate::BridgeError;
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Active,
    Draining,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Result of a [`Bridge::shutdown`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every queued and in-flight unit finished and all workers exited.
    Drained,
    /// The grace period ran out with `busy` workers still running; they were
    /// detached.
    GraceExpired { busy: usize },
    /// Shutdown had already been requested; nothing was done.
    AlreadyRequested,
}

/// Point-in-time counters for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub state: PoolState,
    pub max_workers: usize,
    pub active_workers: usize,
    pub peak_workers: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
    pub timed_out: u64,
    pub skipped: u64,
    pub rejected: u64,
}

/// A queued unit of work. The job reports whether the operation panicked.
struct WorkUnit {
    operation: &'static str,
    key: Option<String>,
    submitted_at: Instant,
    deadline: Instant,
    abandoned: Arc<AtomicBool>,
    job: Box<dyn FnOnce() -> bool + Send>,
}

struct Queue {
    units: VecDeque<WorkUnit>,
    state: PoolState,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
}

struct Shared {
    queue: Mutex<Queue>,
    work_ready: Condvar,
    live_workers: Mutex<usize>,
    worker_exited: Condvar,
    locks: NameLocks,
    active: AtomicUsize,
    peak: AtomicUsize,
    counters: Counters,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the oldest unit that can run now, claiming its name if it has one.
    /// Units whose caller already gave up are dropped on the way.
    fn take_runnable(&self, queue: &mut Queue) -> Option<(WorkUnit, Option<NameGuard>)> {
        let now = Instant::now();
        let mut index = 0;
        while index < queue.units.len() {
            let unit = &queue.units[index];
            if unit.abandoned.load(Ordering::SeqCst) || now >= unit.deadline {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "skipping {}: caller gave up after {:?} in queue",
                    unit.operation,
                    unit.submitted_at.elapsed()
                );
                // Dropping the unit drops its sender; the caller reads that as a timeout.
                drop(queue.units.remove(index));
                continue;
            }
            let guard = match &unit.key {
                Some(name) => match self.locks.try_acquire(name) {
                    Some(guard) => Some(guard),
                    None => {
                        index += 1;
                        continue;
                    }
                },
                None => None,
            };
            return queue.units.remove(index).map(|unit| (unit, guard));
        }
        None
    }

    fn next_unit(&self) -> Option<(WorkUnit, Option<NameGuard>)> {
        let mut queue = self.lock_queue();
        loop {
            if let Some(picked) = self.take_runnable(&mut queue) {
                return Some(picked);
            }
            // Units blocked on a held name keep the worker around until the
            // holder releases it.
            if queue.units.is_empty() && queue.state != PoolState::Active {
                return None;
            }
            queue = self
                .work_ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn execute(&self, unit: WorkUnit, guard: Option<NameGuard>) {
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        debug!(
            "{} started after {:?} in queue ({running} active)",
            unit.operation,
            unit.submitted_at.elapsed()
        );

        let panicked = (unit.job)();

        self.active.fetch_sub(1, Ordering::SeqCst);
        if panicked {
            self.counters.panicked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(guard) = guard {
            drop(guard);
            // Taking the queue lock orders this wake-up after any scan that
            // saw the name as held.
            let _queue = self.lock_queue();
            self.work_ready.notify_all();
        }
    }

    fn worker_loop(&self) {
        while let Some((unit, guard)) = self.next_unit() {
            self.execute(unit, guard);
        }
        let mut live = self
            .live_workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *live -= 1;
        self.worker_exited.notify_all();
    }
}

/// Fixed-size worker pool with per-submission deadlines.
pub struct Bridge {
    shared: Arc<Shared>,
    max_workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(max_workers: usize) -> Result<Self, BridgeError> {
        if max_workers == 0 {
            return Err(BridgeError::NoWorkers);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                units: VecDeque::new(),
                state: PoolState::Active,
            }),
            work_ready: Condvar::new(),
            live_workers: Mutex::new(0),
            worker_exited: Condvar::new(),
            locks: NameLocks::new(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            counters: Counters::default(),
        });

        let bridge = Self {
            shared,
            max_workers,
            handles: Mutex::new(Vec::with_capacity(max_workers)),
        };

        for index in 0..max_workers {
            let shared = Arc::clone(&bridge.shared);
            *bridge
                .shared
                .live_workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner) += 1;
            let spawned = std::thread::Builder::new()
                .name(format!("podgate-worker-{index}"))
                .spawn(move || shared.worker_loop());
            match spawned {
                Ok(handle) => bridge.lock_handles().push(handle),
                Err(e) => {
                    *bridge
                        .shared
                        .live_workers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) -= 1;
                    // Dropping the bridge stops the workers spawned so far.
                    return Err(BridgeError::Spawn(e));
                }
            }
        }

        info!("worker pool started with {max_workers} workers");
        Ok(bridge)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn state(&self) -> PoolState {
        self.shared.lock_queue().state
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` on a worker and wait at most `timeout` for its result.
    ///
    /// Always returns a value: the operation's output, a timeout, a captured
    /// panic, or a rejection once shutdown has begun. Never blocks past
    /// `timeout` (plus scheduling noise).
    pub fn submit<T, F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        op: F,
    ) -> Result<T, BridgeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(operation, None, timeout, op)
    }

    /// Like [`Bridge::submit`], but never runs two units for the same `name`
    /// at once. A unit waiting for its name stays queued, so its deadline
    /// still applies and no worker is held while it waits.
    pub fn submit_exclusive<T, F>(
        &self,
        operation: &'static str,
        name: &str,
        timeout: Duration,
        op: F,
    ) -> Result<T, BridgeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(operation, Some(name.to_owned()), timeout, op)
    }

    /// Names currently claimed by running units.
    pub fn locks(&self) -> &NameLocks {
        &self.shared.locks
    }

    fn enqueue<T, F>(
        &self,
        operation: &'static str,
        key: Option<String>,
        timeout: Duration,
        op: F,
    ) -> Result<T, BridgeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let submitted_at = Instant::now();
        let deadline = submitted_at
            .checked_add(timeout)
            .unwrap_or_else(|| submitted_at + Duration::from_secs(u64::from(u32::MAX)));
        let (tx, rx) = mpsc::sync_channel(1);
        let abandoned = Arc::new(AtomicBool::new(false));

        let job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(op));
            let panicked = result.is_err();
            // The receiver is gone if the caller already timed out.
            let _ = tx.send(result);
            panicked
        });

        {
            let mut queue = self.shared.lock_queue();
            if queue.state != PoolState::Active {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(BridgeError::ShuttingDown);
            }
            queue.units.push_back(WorkUnit {
                operation,
                key,
                submitted_at,
                deadline,
                abandoned: Arc::clone(&abandoned),
                job,
            });
        }
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        // A waiting worker may be parked on a blocked name; wake them all so
        // one that can take this unit does.
        self.shared.work_ready.notify_all();

        self.await_outcome(&rx, operation, timeout, deadline, &abandoned)
    }

    /// Wait for a unit's result against the same deadline the workers use.
    fn await_outcome<T>(
        &self,
        rx: &Receiver<thread::Result<T>>,
        operation: &'static str,
        timeout: Duration,
        deadline: Instant,
        abandoned: &AtomicBool,
    ) -> Result<T, BridgeError> {
        let received = rx.recv_timeout(deadline.saturating_duration_since(Instant::now()));
        let timed_out = match received {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(payload)) => {
                return Err(BridgeError::Panicked {
                    operation,
                    message: panic_message(payload.as_ref()),
                })
            }
            Err(RecvTimeoutError::Timeout) => true,
            // A worker drops expired units unrun, which closes the channel.
            Err(RecvTimeoutError::Disconnected) => Instant::now() >= deadline,
        };
        if !timed_out {
            return Err(BridgeError::Lost { operation });
        }
        abandoned.store(true, Ordering::SeqCst);
        self.shared.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        Err(BridgeError::Timeout {
            operation,
            after: timeout,
        })
    }

    /// Stop accepting work, let queued and running units finish for up to
    /// `grace`, then release the workers. Calling it again is a no-op.
    pub fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        {
            let mut queue = self.shared.lock_queue();
            if queue.state != PoolState::Active {
                return ShutdownOutcome::AlreadyRequested;
            }
            queue.state = PoolState::Draining;
            info!(
                "draining worker pool: {} queued, {} running",
                queue.units.len(),
                self.shared.active.load(Ordering::SeqCst)
            );
        }
        self.shared.work_ready.notify_all();

        let live = self
            .shared
            .live_workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (live, _) = self
            .shared
            .worker_exited
            .wait_timeout_while(live, grace, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
        let busy = *live;
        drop(live);

        let handles: Vec<JoinHandle<()>> = self.lock_handles().drain(..).collect();
        let outcome = if busy == 0 {
            for handle in handles {
                let _ = handle.join();
            }
            ShutdownOutcome::Drained
        } else {
            warn!("{busy} workers still busy after {grace:?}; detaching them");
            ShutdownOutcome::GraceExpired { busy }
        };

        self.shared.lock_queue().state = PoolState::Stopped;
        info!("worker pool stopped");
        outcome
    }

    pub fn stats(&self) -> BridgeStats {
        let (state, queued) = {
            let queue = self.shared.lock_queue();
            (queue.state, queue.units.len())
        };
        let c = &self.shared.counters;
        BridgeStats {
            state,
            max_workers: self.max_workers,
            active_workers: self.shared.active.load(Ordering::SeqCst),
            peak_workers: self.shared.peak.load(Ordering::SeqCst),
            queued,
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Workers finish whatever is queued and exit on their own.
        let mut queue = self.shared.lock_queue();
        if queue.state == PoolState::Active {
            queue.state = PoolState::Draining;
        }
        drop(queue);
        self.shared.work_ready.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
