//! Bounded worker-thread pool for tagged background work
//!
//! Work is queued on a crossbeam channel and executed by a fixed set of
//! worker threads. Every task gets a [`CancelToken`] linked to the
//! scheduler's shutdown token. Tags allow a group of tasks to be cancelled
//! and waited for (`cancel_and_wait`) without shutting the pool down.

use crate::cancel::CancelToken;
use crate::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

type Work = Box<dyn FnOnce(&CancelToken) + Send + 'static>;
type FinishedCallback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Panicked,
}

/// A unit of work with an optional tag and completion callback
pub struct Task {
    work: Work,
    tag: Option<String>,
    on_finished: Option<FinishedCallback>,
}

impl Task {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        Self {
            work: Box::new(work),
            tag: None,
            on_finished: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Run `callback` on the worker after the task ends, however it ends
    pub fn on_finished<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        self.on_finished = Some(Box::new(callback));
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

struct Completion {
    outcome: Mutex<Option<TaskOutcome>>,
    done: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn finish(&self, outcome: TaskOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.notify_all();
        }
    }

    fn get(&self) -> Option<TaskOutcome> {
        *self.outcome.lock()
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Option<TaskOutcome> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = *slot {
                return Some(outcome);
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut slot, deadline).timed_out() {
                        return *slot;
                    }
                }
                None => self.done.wait(&mut slot),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Running(ThreadId),
}

struct Entry {
    tag: Option<String>,
    token: CancelToken,
    completion: Arc<Completion>,
    state: EntryState,
}

struct Job {
    id: u64,
    task: Task,
    token: CancelToken,
    completion: Arc<Completion>,
}

struct Shared {
    entries: Mutex<HashMap<u64, Entry>>,
    changed: Condvar,
    shutdown: CancelToken,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Shared {
    /// Drop a not-yet-started task from tracking. The worker that later
    /// dequeues it only runs the completion callback.
    fn cancel_pending(&self, entries: &mut HashMap<u64, Entry>, id: u64) {
        let is_pending = entries.get(&id).map_or(false, |e| e.state == EntryState::Pending);
        if is_pending {
            if let Some(entry) = entries.remove(&id) {
                entry.token.cancel();
                entry.completion.finish(TaskOutcome::Cancelled);
            }
        }
    }
}

/// Handle to a submitted task
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    token: CancelToken,
    completion: Arc<Completion>,
    shared: Weak<Shared>,
}

impl TaskHandle {
    /// Request cancellation. A task that has not started yet never runs.
    pub fn cancel(&self) {
        self.token.cancel();
        if let Some(shared) = self.shared.upgrade() {
            let mut entries = shared.entries.lock();
            shared.cancel_pending(&mut entries, self.id);
            shared.changed.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.completion.get().is_some()
    }

    /// Block until the task ends
    pub fn wait(&self) -> TaskOutcome {
        self.completion
            .wait_until(None)
            .unwrap_or(TaskOutcome::Cancelled)
    }

    /// Block until the task ends or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        self.completion.wait_until(Some(Instant::now() + timeout))
    }
}

/// Fixed-size worker pool
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker_count: usize,
}

impl TaskScheduler {
    /// Start `workers` worker threads
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Job>();

        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            shutdown: CancelToken::new(),
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(workers)),
            next_id: AtomicU64::new(1),
        });

        for i in 0..workers {
            let rx = rx.clone();
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("picsort-worker-{}", i))
                .spawn(move || worker_loop(worker_shared, rx))?;
            shared.workers.lock().push(handle);
        }

        tracing::info!("Task scheduler started with {} workers", workers);
        Ok(Self {
            shared,
            worker_count: workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue a task. Returns `None` once shutdown has begun.
    pub fn submit(&self, task: Task) -> Option<TaskHandle> {
        if self.shared.shutdown.is_cancelled() {
            tracing::debug!("Rejected task {:?}: scheduler shutting down", task.tag());
            return None;
        }

        let sender_guard = self.shared.sender.lock();
        let sender = sender_guard.as_ref()?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shared.shutdown.child();
        let completion = Arc::new(Completion::new());

        self.shared.entries.lock().insert(
            id,
            Entry {
                tag: task.tag.clone(),
                token: token.clone(),
                completion: Arc::clone(&completion),
                state: EntryState::Pending,
            },
        );

        let job = Job {
            id,
            task,
            token: token.clone(),
            completion: Arc::clone(&completion),
        };

        if sender.send(job).is_err() {
            self.shared.entries.lock().remove(&id);
            return None;
        }

        Some(TaskHandle {
            id,
            token,
            completion,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Cancel every task carrying `tag` and block until none is running.
    ///
    /// A task calling this for its own tag does not wait for itself.
    pub fn cancel_and_wait(&self, tag: &str) {
        let me = std::thread::current().id();
        let mut entries = self.shared.entries.lock();

        let ids: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| e.tag.as_deref() == Some(tag))
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(entry) = entries.get(id) {
                entry.token.cancel();
            }
            self.shared.cancel_pending(&mut entries, *id);
        }
        self.shared.changed.notify_all();

        loop {
            let running = entries.values().any(|e| {
                e.tag.as_deref() == Some(tag) && matches!(e.state, EntryState::Running(t) if t != me)
            });
            if !running {
                break;
            }
            self.shared.changed.wait(&mut entries);
        }

        tracing::debug!("Cancelled tasks tagged '{}'", tag);
    }

    /// Block until no task is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut entries = self.shared.entries.lock();
        while !entries.is_empty() {
            if self.shared.changed.wait_until(&mut entries, deadline).timed_out() {
                return entries.is_empty();
            }
        }
        true
    }

    /// Tasks queued or running
    pub fn pending_count(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Tasks queued or running with `tag`
    pub fn tagged_count(&self, tag: &str) -> usize {
        self.shared
            .entries
            .lock()
            .values()
            .filter(|e| e.tag.as_deref() == Some(tag))
            .count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// The root token every task token descends from
    pub fn shutdown_token(&self) -> &CancelToken {
        &self.shared.shutdown
    }

    /// Stop accepting work and cancel everything queued or running.
    /// Does not block; see [`TaskScheduler::join`].
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Task scheduler shutting down");
        self.shared.shutdown.cancel();

        {
            let mut entries = self.shared.entries.lock();
            let ids: Vec<u64> = entries.keys().copied().collect();
            for id in ids {
                self.shared.cancel_pending(&mut entries, id);
            }
            self.shared.changed.notify_all();
        }

        // Workers exit once the queue is drained
        drop(self.shared.sender.lock().take());
    }

    /// Shut down and wait for the worker threads to exit
    pub fn join(&self) {
        self.shutdown();
        let me = std::thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("Worker thread panicked outside a task");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        run_job(&shared, job);
    }
    tracing::debug!("Worker exiting");
}

fn run_job(shared: &Shared, job: Job) {
    let Job {
        id,
        task,
        token,
        completion,
    } = job;
    let Task {
        work,
        tag,
        on_finished,
    } = task;

    let started = {
        let mut entries = shared.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if !token.is_cancelled() => {
                entry.state = EntryState::Running(std::thread::current().id());
                true
            }
            _ => {
                entries.remove(&id);
                shared.changed.notify_all();
                false
            }
        }
    };

    let outcome = if !started {
        TaskOutcome::Cancelled
    } else {
        match catch_unwind(AssertUnwindSafe(|| work(&token))) {
            Ok(()) if token.is_cancelled() => TaskOutcome::Cancelled,
            Ok(()) => TaskOutcome::Completed,
            Err(payload) => {
                tracing::error!("Task {:?} panicked: {}", tag, panic_message(payload.as_ref()));
                TaskOutcome::Panicked
            }
        }
    };

    if let Some(callback) = on_finished {
        if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
            tracing::error!("Completion callback for task {:?} panicked", tag);
        }
    }

    {
        let mut entries = shared.entries.lock();
        entries.remove(&id);
        shared.changed.notify_all();
    }
    completion.finish(outcome);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_submit_and_wait() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let handle = scheduler
            .submit(Task::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(handle.wait_timeout(WAIT), Some(TaskOutcome::Completed));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn test_on_finished_runs_before_wait_returns() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);

        let handle = scheduler
            .submit(Task::new(|_| {}).on_finished(move |outcome| *s.lock() = Some(outcome)))
            .unwrap();

        handle.wait();
        assert_eq!(*seen.lock(), Some(TaskOutcome::Completed));
    }

    #[test]
    fn test_panic_is_isolated() {
        let scheduler = TaskScheduler::new(1).unwrap();

        let bad = scheduler.submit(Task::new(|_| panic!("boom"))).unwrap();
        assert_eq!(bad.wait_timeout(WAIT), Some(TaskOutcome::Panicked));

        let good = scheduler.submit(Task::new(|_| {})).unwrap();
        assert_eq!(good.wait_timeout(WAIT), Some(TaskOutcome::Completed));
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let scheduler = TaskScheduler::new(1).unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
        assert!(scheduler.submit(Task::new(|_| {})).is_none());
        scheduler.join();
    }

    #[test]
    fn test_cancel_and_wait_stops_tagged_tasks() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&started);

        let watch = scheduler
            .submit(
                Task::new(move |token| {
                    s.fetch_add(1, Ordering::SeqCst);
                    while token.sleep(Duration::from_millis(10)) {}
                })
                .with_tag("monitor"),
            )
            .unwrap();
        let other = scheduler
            .submit(Task::new(|token| {
                token.sleep(Duration::from_millis(200));
            }))
            .unwrap();

        let deadline = Instant::now() + WAIT;
        while started.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        scheduler.cancel_and_wait("monitor");
        assert_eq!(scheduler.tagged_count("monitor"), 0);
        assert_eq!(watch.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
        assert!(!other.is_cancelled());
        assert_eq!(other.wait_timeout(WAIT), Some(TaskOutcome::Completed));
    }

    #[test]
    fn test_cancelled_pending_task_never_runs() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker
        let blocker = scheduler
            .submit(Task::new(|token| {
                token.sleep(Duration::from_millis(100));
            }))
            .unwrap();

        let r = Arc::clone(&ran);
        let queued = scheduler
            .submit(Task::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        queued.cancel();

        assert_eq!(queued.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
        blocker.wait();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_cancels_running_work() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let handle = scheduler
            .submit(Task::new(|token| {
                token.sleep(Duration::from_secs(30));
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        scheduler.shutdown();
        assert_eq!(handle.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
        scheduler.join();
        assert_eq!(scheduler.pending_count(), 0);
    }
}
