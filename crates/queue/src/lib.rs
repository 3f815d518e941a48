//! In-memory job queue with subscriber matching.
//!
//! A single mutex guards `pending`, `running` and `waiters`. Matching is a
//! synchronous, non-blocking pass run inline from `push` and `poll` — there
//! is no background task, since the pass never performs I/O and completes in
//! bounded time under the lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Grace period added on top of a job's declared timeout before it is
/// considered abandoned.
const GRACE: Duration = Duration::from_secs(60);

/// Default timeout applied when a job declares `timeout_minutes == 0`.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// A unit of work a producer pushes and a consumer polls for.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub timeout_minutes: u32,
    pub config: serde_json::Value,
    pub labels: BTreeMap<String, String>,
}

/// Predicate a poller uses to pick jobs out of the pending list.
///
/// Must be fast and side-effect free; a panic inside one is caught and
/// logged rather than allowed to unwind through the matching pass.
pub type Filter = Arc<dyn Fn(&Job) -> bool + Send + Sync>;

fn matches_safely(filter: &Filter, job: &Job) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| filter(job))) {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(job_id = %job.id, "queue filter panicked, treating as non-match");
            false
        }
    }
}

/// A single-shot, multi-waiter completion signal.
///
/// `None` means not yet settled; `Some(None)` means settled without error;
/// `Some(Some(err))` means settled with an error message.
struct Done {
    notify: Notify,
    result: Mutex<Option<Option<String>>>,
}

impl Done {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    fn close(&self, err: Option<String>) {
        let mut result = self.result.lock().unwrap();
        if result.is_none() {
            *result = Some(err);
        }
        self.notify.notify_waiters();
    }

    /// Waits for `close` to be called, tolerating any number of concurrent
    /// callers. Uses `Notified::enable` so a `close` racing this call's
    /// registration is never missed.
    async fn wait(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(v) = &*self.result.lock().unwrap() {
                return v.clone();
            }
            notified.await;
        }
    }
}

struct RunningEntry {
    job: Job,
    deadline: Instant,
    done: Arc<Done>,
}

struct Waiter {
    id: u64,
    filter: Filter,
    tx: Option<oneshot::Sender<Job>>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Job>,
    running: HashMap<String, RunningEntry>,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

fn compute_deadline(timeout_minutes: u32) -> Instant {
    let timeout = if timeout_minutes == 0 {
        DEFAULT_TIMEOUT
    } else {
        Duration::from_secs(timeout_minutes as u64 * 60)
    };
    Instant::now() + GRACE + timeout
}

/// The queue. Cheap to clone; clones share the same underlying state.
#[derive(Clone, Default)]
pub struct Queue(Arc<Mutex<State>>);

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a job to the pending list and runs a matching pass.
    pub fn push(&self, job: Job) {
        {
            let mut state = self.0.lock().unwrap();
            state.pending.push_back(job);
        }
        self.process();
    }

    /// Blocks until a pending job satisfies `filter`, or `cancel` fires.
    pub async fn poll(&self, filter: Filter, cancel: CancellationToken) -> Option<Job> {
        let (tx, rx) = oneshot::channel();
        let waiter_id = {
            let mut state = self.0.lock().unwrap();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push(Waiter {
                id,
                filter,
                tx: Some(tx),
            });
            id
        };
        self.process();

        tokio::select! {
            res = rx => res.ok(),
            _ = cancel.cancelled() => {
                let mut state = self.0.lock().unwrap();
                state.waiters.retain(|w| w.id != waiter_id);
                None
            }
        }
    }

    /// Marks `id` settled with no error. No-op if `id` is not running.
    pub fn done(&self, id: &str) {
        self.error(id, None);
    }

    /// Marks `id` settled, optionally with an error. No-op if `id` is not
    /// running (tolerates duplicate/late calls after a reconnect).
    pub fn error(&self, id: &str, err: Option<String>) {
        let mut state = self.0.lock().unwrap();
        if let Some(entry) = state.running.remove(id) {
            entry.done.close(err);
        }
    }

    /// Blocks until `id` settles, or `cancel` fires. Returns `None`
    /// immediately if `id` is unknown.
    pub async fn wait(&self, id: &str, cancel: CancellationToken) -> Option<String> {
        let done = {
            let state = self.0.lock().unwrap();
            state.running.get(id).map(|e| e.done.clone())
        }?;

        tokio::select! {
            res = done.wait() => res,
            _ = cancel.cancelled() => None,
        }
    }

    /// Pushes `id`'s deadline forward. No-op if `id` is not running.
    pub fn extend(&self, id: &str) {
        let mut state = self.0.lock().unwrap();
        if let Some(entry) = state.running.get_mut(id) {
            entry.deadline = compute_deadline(entry.job.timeout_minutes);
        }
    }

    fn process(&self) {
        let mut state = self.0.lock().unwrap();
        sweep_expired(&mut state);
        match_pass(&mut state);
    }
}

fn sweep_expired(state: &mut State) {
    let now = Instant::now();
    let expired: Vec<String> = state
        .running
        .iter()
        .filter(|(_, e)| e.deadline < now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in expired {
        if let Some(entry) = state.running.remove(&id) {
            entry.done.close(None);
            state.pending.push_front(entry.job);
        }
    }
}

fn match_pass(state: &mut State) {
    if state.waiters.is_empty() || state.pending.is_empty() {
        return;
    }
    let taken: Vec<Job> = state.pending.drain(..).collect();
    let mut still_pending = VecDeque::with_capacity(taken.len());

    for job in taken {
        let mut match_idx = None;
        for (i, w) in state.waiters.iter().enumerate() {
            if matches_safely(&w.filter, &job) {
                match_idx = Some(i);
                break;
            }
        }

        let mut dispatched = false;
        if let Some(i) = match_idx {
            let mut waiter = state.waiters.remove(i);
            if let Some(tx) = waiter.tx.take() {
                let deadline = compute_deadline(job.timeout_minutes);
                let done = Arc::new(Done::new());
                state.running.insert(
                    job.id.clone(),
                    RunningEntry {
                        job: job.clone(),
                        deadline,
                        done,
                    },
                );
                // Oneshot send never blocks; if the receiver already
                // dropped (caller cancelled between registering and here)
                // the job simply stays running until its deadline sweeps it
                // back to pending.
                let _ = tx.send(job);
                dispatched = true;
            }
        }
        if !dispatched {
            still_pending.push_back(job);
        }
    }

    state.pending = still_pending;
}
