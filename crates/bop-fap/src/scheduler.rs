use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossfire::{MTx, Rx, mpsc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

use crate::error::ErrorCode;
use crate::result::{FastAddPeerResult, FastAddPeerStatus};
use crate::runtime::FapRuntime;

pub type TaskId = u64;

/// Work executed for one task on the blocking pool.
pub type FastAddPeerJob = Box<dyn FnOnce() -> FastAddPeerResult + Send + 'static>;

/// Configuration options for the restore scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Restore jobs allowed to run at once; further tasks queue in FIFO order.
    pub pool_size: usize,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("task {0} is already scheduled")]
    AlreadyScheduled(TaskId),
    #[error("scheduler is shut down")]
    Closed,
}

impl ScheduleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ScheduleError::AlreadyScheduled(_) => ErrorCode::ConcurrencyViolation,
            ScheduleError::Closed => ErrorCode::OperationCancelled,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The task is unknown, still running, or its result was already taken.
    #[error("task {0} has no result ready")]
    NotReady(TaskId),
}

impl FetchError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ConcurrencyViolation
    }
}

/// Snapshot of scheduler metrics for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
    pub active: usize,
    pub tracked_tasks: usize,
}

#[derive(Debug)]
enum SlotState {
    Scheduled,
    Running,
    Ready(FastAddPeerResult),
    Consumed,
}

#[derive(Debug)]
struct TaskSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Scheduled),
            ready: Condvar::new(),
        }
    }

    fn is_ready(&self) -> bool {
        matches!(
            *self.state.lock().expect("task slot mutex poisoned"),
            SlotState::Ready(_)
        )
    }

    fn mark_running(&self) {
        let mut state = self.state.lock().expect("task slot mutex poisoned");
        if matches!(*state, SlotState::Scheduled) {
            *state = SlotState::Running;
        }
    }

    /// Fail a task that never started. False if it already has a result.
    fn fail_pending(&self) -> bool {
        let mut state = self.state.lock().expect("task slot mutex poisoned");
        if !matches!(*state, SlotState::Scheduled) {
            return false;
        }
        *state = SlotState::Ready(FastAddPeerResult::with_status(FastAddPeerStatus::Failed));
        self.ready.notify_all();
        true
    }

    fn complete(&self, result: FastAddPeerResult) {
        let mut state = self.state.lock().expect("task slot mutex poisoned");
        *state = SlotState::Ready(result);
        self.ready.notify_all();
    }

    fn take(&self) -> Option<FastAddPeerResult> {
        let mut state = self.state.lock().expect("task slot mutex poisoned");
        match std::mem::replace(&mut *state, SlotState::Consumed) {
            SlotState::Ready(result) => Some(result),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Block until the slot leaves Scheduled/Running or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("task slot mutex poisoned");
        loop {
            if matches!(*state, SlotState::Ready(_) | SlotState::Consumed) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .expect("task slot mutex poisoned")
                .0;
        }
    }
}

/// Completion handle returned by [`FastAddPeerScheduler::add_task`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    slot: Arc<TaskSlot>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Wait for the task to finish. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.slot.wait(timeout)
    }
}

/// Bounded worker pool running restore jobs keyed by task id.
///
/// Each task yields exactly one result, which can be fetched once.
pub struct FastAddPeerScheduler {
    state: Arc<SchedulerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FastAddPeerScheduler {
    pub fn new(runtime: Arc<FapRuntime>, config: SchedulerConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::bounded_blocking(capacity);
        let state = Arc::new(SchedulerState {
            runtime,
            tasks: DashMap::new(),
            sender: Arc::new(sender),
            metrics: SchedulerMetrics::default(),
            shutdown: AtomicBool::new(false),
            admission: RwLock::new(true),
            pool_size: config.pool_size.max(1),
        });
        let worker = spawn_dispatcher(receiver, state.clone());
        Self {
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// True while the task is queued, running, or holds an unfetched result.
    pub fn is_scheduled(&self, task_id: TaskId) -> bool {
        self.state.tasks.contains_key(&task_id)
    }

    #[instrument(skip(self, job))]
    pub fn add_task(&self, task_id: TaskId, job: FastAddPeerJob) -> Result<TaskHandle, ScheduleError> {
        if self.state.is_shutdown() {
            return Err(ScheduleError::Closed);
        }
        // Held across the send so the dispatcher cannot close admission
        // between our check and our submission.
        let admission = self
            .state
            .admission
            .read()
            .expect("scheduler admission lock poisoned");
        if !*admission {
            return Err(ScheduleError::Closed);
        }

        let slot = match self.state.tasks.entry(task_id) {
            Entry::Occupied(_) => return Err(ScheduleError::AlreadyScheduled(task_id)),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(TaskSlot::new());
                vacant.insert(slot.clone());
                slot
            }
        };

        if self
            .state
            .sender
            .send(SchedulerCommand::Submit {
                task_id,
                slot: slot.clone(),
                job,
            })
            .is_err()
        {
            self.state.tasks.remove(&task_id);
            return Err(ScheduleError::Closed);
        }
        drop(admission);

        self.state.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        trace!("task scheduled");
        Ok(TaskHandle { task_id, slot })
    }

    pub fn is_ready(&self, task_id: TaskId) -> bool {
        self.state
            .tasks
            .get(&task_id)
            .map(|slot| slot.is_ready())
            .unwrap_or(false)
    }

    /// Take the result of a finished task. A second fetch fails.
    pub fn fetch_result(&self, task_id: TaskId) -> Result<FastAddPeerResult, FetchError> {
        let (_, slot) = self
            .state
            .tasks
            .remove_if(&task_id, |_, slot| slot.is_ready())
            .ok_or(FetchError::NotReady(task_id))?;
        slot.take().ok_or(FetchError::NotReady(task_id))
    }

    /// Block until the task finishes, then fetch its result.
    pub fn wait_result(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<FastAddPeerResult, FetchError> {
        let slot = self
            .state
            .tasks
            .get(&task_id)
            .map(|slot| slot.value().clone())
            .ok_or(FetchError::NotReady(task_id))?;
        slot.wait(timeout);
        self.fetch_result(task_id)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.state.snapshot()
    }

    /// Stop admission, fail queued tasks, and wait for running ones.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        debug!("shutting down fast-add-peer scheduler");
        if self.state.request_shutdown() {
            let _ = self.state.sender.send(SchedulerCommand::Shutdown);
        }
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        debug!("fast-add-peer scheduler shutdown complete");
    }
}

impl Drop for FastAddPeerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for FastAddPeerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastAddPeerScheduler")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

struct SchedulerState {
    runtime: Arc<FapRuntime>,
    tasks: DashMap<TaskId, Arc<TaskSlot>>,
    sender: Arc<MTx<SchedulerCommand>>,
    metrics: SchedulerMetrics,
    shutdown: AtomicBool,
    /// False once the dispatcher stops taking submissions.
    admission: RwLock<bool>,
    pool_size: usize,
}

impl SchedulerState {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            panicked: self.metrics.panicked.load(Ordering::Relaxed),
            active: self.metrics.active.load(Ordering::Acquire),
            tracked_tasks: self.tasks.len(),
        }
    }

    /// Resolve a task that will never run.
    fn abandon(&self, task_id: TaskId, slot: &TaskSlot) {
        if slot.fail_pending() {
            warn!(task_id, "task abandoned at shutdown");
            self.metrics.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fail every submission still in the channel.
    fn abandon_pending(&self, receiver: &Rx<SchedulerCommand>) {
        while let Ok(command) = receiver.try_recv() {
            if let SchedulerCommand::Submit { task_id, slot, .. } = command {
                self.abandon(task_id, &slot);
            }
        }
    }

    /// Refuse further submissions, then fail the ones that got in first.
    fn close_admission(&self, receiver: &Rx<SchedulerCommand>) {
        loop {
            match self.admission.try_write() {
                Ok(mut open) => {
                    *open = false;
                    break;
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    *poisoned.into_inner() = false;
                    break;
                }
                // A submitter may be blocked on a full channel while holding
                // the read side; keep draining so it can finish.
                Err(TryLockError::WouldBlock) => {
                    self.abandon_pending(receiver);
                    thread::yield_now();
                }
            }
        }
        self.abandon_pending(receiver);
    }
}

#[derive(Debug, Default)]
struct SchedulerMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    active: AtomicUsize,
}

enum SchedulerCommand {
    Submit {
        task_id: TaskId,
        slot: Arc<TaskSlot>,
        job: FastAddPeerJob,
    },
    Completion {
        task_id: TaskId,
    },
    Shutdown,
}

struct QueuedTask {
    task_id: TaskId,
    slot: Arc<TaskSlot>,
    job: FastAddPeerJob,
}

fn spawn_dispatcher(receiver: Rx<SchedulerCommand>, state: Arc<SchedulerState>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("bop-fap-dispatch".into())
        .spawn(move || {
            debug!("scheduler dispatcher thread started");
            dispatcher_main(receiver, state);
            debug!("scheduler dispatcher thread exiting");
        })
        .expect("failed to spawn fast-add-peer dispatcher thread")
}

fn dispatcher_main(receiver: Rx<SchedulerCommand>, state: Arc<SchedulerState>) {
    let mut backlog: VecDeque<QueuedTask> = VecDeque::new();
    let mut active = 0usize;
    let mut shutting_down = false;

    loop {
        if shutting_down && active == 0 {
            break;
        }

        match receiver.recv() {
            Ok(SchedulerCommand::Submit { task_id, slot, job }) => {
                if shutting_down {
                    state.abandon(task_id, &slot);
                    continue;
                }
                if active < state.pool_size {
                    if spawn_job(&state, QueuedTask { task_id, slot, job }) {
                        active += 1;
                    }
                } else {
                    trace!(task_id, backlog = backlog.len() + 1, "pool saturated, task queued");
                    backlog.push_back(QueuedTask { task_id, slot, job });
                }
            }
            Ok(SchedulerCommand::Completion { task_id }) => {
                trace!(task_id, "task completed");
                active = active.saturating_sub(1);
                while active < state.pool_size && !shutting_down {
                    let Some(next) = backlog.pop_front() else {
                        break;
                    };
                    if spawn_job(&state, next) {
                        active += 1;
                    }
                }
            }
            Ok(SchedulerCommand::Shutdown) => {
                debug!(queued = backlog.len(), active, "dispatcher received shutdown signal");
                shutting_down = true;
                while let Some(item) = backlog.pop_front() {
                    state.abandon(item.task_id, &item.slot);
                }
            }
            Err(_) => {
                warn!("scheduler channel closed");
                break;
            }
        }
        state.metrics.active.store(active, Ordering::Release);
    }

    // Submissions that raced with shutdown still get a result.
    state.close_admission(&receiver);
}

/// Returns false when the job could not be started and was resolved in place.
fn spawn_job(state: &Arc<SchedulerState>, task: QueuedTask) -> bool {
    let (task_id, slot) = (task.task_id, task.slot.clone());
    let sender = state.sender.clone();
    let job_state = state.clone();
    let spawned = state.runtime.spawn_blocking(move || {
        let state = job_state;
        let QueuedTask { task_id, slot, job } = task;
        slot.mark_running();
        let result = match catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(task_id, panic = %message, code = %ErrorCode::WorkerPanic, "restore job panicked");
                state.metrics.panicked.fetch_add(1, Ordering::Relaxed);
                FastAddPeerResult::with_status(FastAddPeerStatus::Failed)
            }
        };
        state.metrics.completed.fetch_add(1, Ordering::Relaxed);
        slot.complete(result);
        let _ = sender.send(SchedulerCommand::Completion { task_id });
    });
    if spawned.is_none() {
        state.abandon(task_id, &slot);
    }
    spawned.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc as std_mpsc;

    use crate::runtime::FapRuntimeOptions;

    fn runtime() -> Arc<FapRuntime> {
        FapRuntime::create(FapRuntimeOptions::default()).expect("create runtime")
    }

    fn ok_job() -> FastAddPeerJob {
        Box::new(|| FastAddPeerResult::ok(vec![1], vec![2]))
    }

    fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) {
        let start = Instant::now();
        while !predicate() {
            if start.elapsed() > timeout {
                panic!("condition not met within {:?}", timeout);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn result_is_fetched_exactly_once() {
        let scheduler = FastAddPeerScheduler::new(runtime(), SchedulerConfig::default());
        assert!(!scheduler.is_scheduled(7));

        let handle = scheduler.add_task(7, ok_job()).unwrap();
        assert!(scheduler.is_scheduled(7));
        assert!(handle.wait(Duration::from_secs(5)));
        assert!(scheduler.is_ready(7));

        let result = scheduler.fetch_result(7).unwrap();
        assert_eq!(result, FastAddPeerResult::ok(vec![1], vec![2]));
        assert_eq!(scheduler.fetch_result(7), Err(FetchError::NotReady(7)));
        assert!(!scheduler.is_scheduled(7));
        assert!(!scheduler.is_ready(7));

        // After consumption the id can be scheduled again.
        scheduler.add_task(7, ok_job()).unwrap();
        assert!(scheduler.wait_result(7, Duration::from_secs(5)).is_ok());
        scheduler.shutdown();
    }

    #[test]
    fn duplicate_add_is_rejected_until_consumed() {
        let scheduler = FastAddPeerScheduler::new(runtime(), SchedulerConfig::default());
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        scheduler
            .add_task(
                1,
                Box::new(move || {
                    let _ = release_rx.recv();
                    FastAddPeerResult::with_status(FastAddPeerStatus::WaitForData)
                }),
            )
            .unwrap();

        let err = scheduler.add_task(1, ok_job()).unwrap_err();
        assert_eq!(err, ScheduleError::AlreadyScheduled(1));
        assert_eq!(err.code(), ErrorCode::ConcurrencyViolation);
        assert_eq!(scheduler.fetch_result(1), Err(FetchError::NotReady(1)));

        release_tx.send(()).unwrap();
        wait_for(|| scheduler.is_ready(1), Duration::from_secs(5));
        // Ready but unfetched still counts as scheduled.
        assert!(scheduler.add_task(1, ok_job()).is_err());
        assert_eq!(
            scheduler.fetch_result(1).unwrap().status,
            FastAddPeerStatus::WaitForData
        );
        scheduler.shutdown();
    }

    #[test]
    fn pool_size_bounds_concurrency() {
        let config = SchedulerConfig {
            pool_size: 2,
            queue_capacity: 16,
        };
        let scheduler = FastAddPeerScheduler::new(runtime(), config);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<TaskHandle> = (0..6)
            .map(|id| {
                let running = running.clone();
                let peak = peak.clone();
                scheduler
                    .add_task(
                        id,
                        Box::new(move || {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(30));
                            running.fetch_sub(1, Ordering::SeqCst);
                            FastAddPeerResult::ok(Vec::new(), Vec::new())
                        }),
                    )
                    .unwrap()
            })
            .collect();

        for handle in &handles {
            assert!(handle.wait(Duration::from_secs(5)));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        for id in 0..6 {
            assert!(scheduler.fetch_result(id).unwrap().is_ok());
        }
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.submitted, 6);
        assert_eq!(snapshot.completed, 6);
        assert_eq!(snapshot.tracked_tasks, 0);
        scheduler.shutdown();
    }

    #[test]
    fn panicking_job_yields_failed_result() {
        let scheduler = FastAddPeerScheduler::new(runtime(), SchedulerConfig::default());
        scheduler
            .add_task(3, Box::new(|| -> FastAddPeerResult { panic!("restore exploded") }))
            .unwrap();
        let result = scheduler.wait_result(3, Duration::from_secs(5)).unwrap();
        assert_eq!(result.status, FastAddPeerStatus::Failed);
        assert_eq!(scheduler.snapshot().panicked, 1);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_fails_queued_tasks_and_rejects_new_ones() {
        let config = SchedulerConfig {
            pool_size: 1,
            queue_capacity: 16,
        };
        let scheduler = FastAddPeerScheduler::new(runtime(), config);
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        scheduler
            .add_task(
                1,
                Box::new(move || {
                    let _ = release_rx.recv();
                    FastAddPeerResult::ok(Vec::new(), Vec::new())
                }),
            )
            .unwrap();
        let queued = scheduler.add_task(2, ok_job()).unwrap();
        wait_for(|| scheduler.snapshot().active == 1, Duration::from_secs(5));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = release_tx.send(());
        });
        scheduler.shutdown();
        releaser.join().unwrap();

        assert!(queued.is_ready());
        assert_eq!(
            scheduler.fetch_result(2).unwrap().status,
            FastAddPeerStatus::Failed
        );
        assert!(scheduler.fetch_result(1).unwrap().is_ok());
        assert_eq!(scheduler.add_task(9, ok_job()).unwrap_err(), ScheduleError::Closed);
    }

    #[test]
    fn concurrent_fetch_yields_single_result() {
        let scheduler = FastAddPeerScheduler::new(runtime(), SchedulerConfig::default());
        scheduler.add_task(11, ok_job()).unwrap();
        wait_for(|| scheduler.is_ready(11), Duration::from_secs(5));

        let fetchers = 8;
        let barrier = std::sync::Barrier::new(fetchers);
        let outcomes: Vec<Result<FastAddPeerResult, FetchError>> = thread::scope(|scope| {
            let joins: Vec<_> = (0..fetchers)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        scheduler.fetch_result(11)
                    })
                })
                .collect();
            joins.into_iter().map(|join| join.join().unwrap()).collect()
        });

        let fetched: Vec<_> = outcomes.iter().filter_map(|outcome| outcome.as_ref().ok()).collect();
        assert_eq!(fetched.len(), 1);
        assert_eq!(*fetched[0], FastAddPeerResult::ok(vec![1], vec![2]));
        let refused = outcomes
            .iter()
            .filter(|outcome| **outcome == Err(FetchError::NotReady(11)))
            .count();
        assert_eq!(refused, fetchers - 1);
        assert!(!scheduler.is_scheduled(11));
        scheduler.shutdown();
    }

    #[test]
    fn tasks_accepted_during_shutdown_still_resolve() {
        for _ in 0..20 {
            let config = SchedulerConfig {
                pool_size: 1,
                queue_capacity: 4,
            };
            let scheduler = FastAddPeerScheduler::new(runtime(), config);
            let barrier = std::sync::Barrier::new(5);
            let handles: Vec<TaskHandle> = thread::scope(|scope| {
                let submitters: Vec<_> = (0..4u64)
                    .map(|worker| {
                        let scheduler = &scheduler;
                        let barrier = &barrier;
                        scope.spawn(move || {
                            barrier.wait();
                            (0..25u64)
                                .filter_map(|n| scheduler.add_task(worker * 100 + n, ok_job()).ok())
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                barrier.wait();
                scheduler.shutdown();
                submitters
                    .into_iter()
                    .flat_map(|join| join.join().unwrap())
                    .collect()
            });

            for handle in &handles {
                assert!(
                    handle.wait(Duration::from_secs(5)),
                    "task {} accepted but never resolved",
                    handle.task_id()
                );
            }
            assert_eq!(scheduler.snapshot().completed, handles.len() as u64);
        }
    }
}
