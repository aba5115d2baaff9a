//! Multi-queue job dispatcher.
//!
//! One dispatch loop claims eligible jobs and runs each on its own task.
//! Claiming visits queues in descending priority weight; inside a queue the
//! waiting set is ordered by job priority, then enqueue sequence, so jobs of
//! equal priority run FIFO. Per-queue concurrency and a global cap bound the
//! number of active jobs.

use super::job::{EnqueueOptions, Job, JobCounts, JobState, QueueDefinition};
use super::QueueError;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Processes jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Failure reported by a handler.
///
/// Retryable failures are redelivered with backoff until `max_attempts`;
/// permanent ones fail the job on the spot.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    retryable: bool,
    message: String,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", e))
    }
}

/// Terminal and retry notifications, broadcast to observers.
#[derive(Clone, Debug)]
pub enum JobEvent {
    Completed(Job),
    Retrying { job: Job, delay: Duration },
    Failed(Job),
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Upper bound on active jobs across all queues.
    pub global_concurrency: usize,
    /// How long `close()` waits for active jobs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 64,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Handle to the dispatcher. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    state: Mutex<DispatchState>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    notify: Notify,
    events: broadcast::Sender<JobEvent>,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

struct DispatchState {
    /// Sorted by descending priority weight.
    queues: Vec<QueueState>,
    jobs: HashMap<String, Job>,
    /// unique_key -> id of the non-terminal job holding it
    unique_keys: HashMap<String, String>,
    active_total: usize,
    next_seq: u64,
    closed: bool,
}

struct QueueState {
    def: QueueDefinition,
    waiting: BTreeMap<(Reverse<i32>, u64), String>,
    delayed: BTreeMap<(Instant, u64), String>,
    active: HashSet<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    completed_total: u64,
    failed_total: u64,
}

impl QueueState {
    fn new(def: QueueDefinition) -> Self {
        Self {
            def,
            waiting: BTreeMap::new(),
            delayed: BTreeMap::new(),
            active: HashSet::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            completed_total: 0,
            failed_total: 0,
        }
    }

    /// Moves a finished job into its retention list and evicts overflow.
    fn retain(&mut self, jobs: &mut HashMap<String, Job>, id: String, state: JobState) {
        let (list, limit) = match state {
            JobState::Completed => (&mut self.completed, self.def.policy.retain_completed),
            _ => (&mut self.failed, self.def.policy.retain_failed),
        };
        list.push_back(id);
        while list.len() > limit {
            if let Some(evicted) = list.pop_front() {
                jobs.remove(&evicted);
            }
        }
    }

    fn collect(&self, jobs: &HashMap<String, Job>, ids: &VecDeque<String>) -> Vec<Job> {
        ids.iter().filter_map(|id| jobs.get(id).cloned()).collect()
    }
}

impl DispatchState {
    fn queue(&self, name: &str) -> Result<&QueueState, QueueError> {
        self.queues
            .iter()
            .find(|q| q.def.name == name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }
}

struct Claimed {
    job: Job,
    handler: Arc<dyn JobHandler>,
    timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher for the given queues. Nothing runs until [`start`](Self::start).
    pub fn new(config: DispatcherConfig, queues: Vec<QueueDefinition>) -> Self {
        let mut queues: Vec<QueueState> = queues.into_iter().map(QueueState::new).collect();
        queues.sort_by_key(|q| Reverse(q.def.priority_weight));

        let (events, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(DispatchState {
                    queues,
                    jobs: HashMap::new(),
                    unique_keys: HashMap::new(),
                    active_total: 0,
                    next_seq: 0,
                    closed: false,
                }),
                handlers: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                events,
                shutdown,
                loop_handle: Mutex::new(None),
            }),
        }
    }

    /// Spawns the dispatch loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut handle = self.inner.loop_handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let shutdown = self.inner.shutdown.subscribe();
        *handle = Some(tokio::spawn(Arc::clone(&self.inner).run(shutdown)));
        info!(
            queues = ?self.queue_names(),
            global_concurrency = self.inner.config.global_concurrency,
            "Job dispatcher started"
        );
    }

    /// Installs the handler for a queue, replacing any previous one.
    pub fn register_handler(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        self.inner.state.lock().unwrap().queue(queue)?;
        self.inner
            .handlers
            .write()
            .unwrap()
            .insert(queue.to_string(), handler);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Adds a job and returns its snapshot. Never waits on processing.
    pub fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError> {
        let job = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            if state.closed {
                return Err(QueueError::Closed);
            }

            let q = state
                .queues
                .iter_mut()
                .find(|q| q.def.name == queue)
                .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

            if let Some(key) = &opts.unique_key {
                if let Some(existing) = state.unique_keys.get(key) {
                    return Err(QueueError::Duplicate {
                        key: key.clone(),
                        existing_id: existing.clone(),
                    });
                }
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            let now = Utc::now();
            let mut job = Job {
                id: Uuid::now_v7().to_string(),
                job_type: job_type.to_string(),
                queue: queue.to_string(),
                payload,
                priority: opts.priority.unwrap_or(0),
                state: JobState::Waiting,
                attempts: 0,
                max_attempts: opts.max_attempts.unwrap_or(q.def.policy.max_attempts).max(1),
                backoff: opts.backoff.unwrap_or(q.def.policy.backoff),
                unique_key: opts.unique_key,
                failed_reason: None,
                created_at: now,
                run_at: None,
                processed_at: None,
                finished_at: None,
                seq,
            };

            match opts.delay.filter(|d| !d.is_zero()) {
                Some(delay) => {
                    job.state = JobState::Delayed;
                    job.run_at = Some(now + chrono_duration(delay));
                    q.delayed.insert((Instant::now() + delay, seq), job.id.clone());
                }
                None => {
                    q.waiting.insert((Reverse(job.priority), seq), job.id.clone());
                }
            }

            if let Some(key) = &job.unique_key {
                state.unique_keys.insert(key.clone(), job.id.clone());
            }
            state.jobs.insert(job.id.clone(), job.clone());
            job
        };

        debug!(
            job_id = %job.id,
            queue = %job.queue,
            job_type = %job.job_type,
            state = ?job.state,
            "Job enqueued"
        );
        self.inner.notify.notify_one();
        Ok(job)
    }

    pub fn stats(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let state = self.inner.state.lock().unwrap();
        let q = state.queue(queue)?;
        Ok(JobCounts {
            waiting: q.waiting.len(),
            active: q.active.len(),
            delayed: q.delayed.len(),
            completed: q.completed_total,
            failed: q.failed_total,
        })
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.inner.state.lock().unwrap().jobs.get(id).cloned()
    }

    /// Retained permanently failed jobs, oldest first.
    pub fn failed_jobs(&self, queue: &str) -> Result<Vec<Job>, QueueError> {
        let state = self.inner.state.lock().unwrap();
        let q = state.queue(queue)?;
        Ok(q.collect(&state.jobs, &q.failed))
    }

    /// Retained completed jobs, oldest first.
    pub fn completed_jobs(&self, queue: &str) -> Result<Vec<Job>, QueueError> {
        let state = self.inner.state.lock().unwrap();
        let q = state.queue(queue)?;
        Ok(q.collect(&state.jobs, &q.completed))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().unwrap();
        state.queues.iter().map(|q| q.def.name.clone()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Stops accepting jobs, stops dispatching, and waits for active jobs
    /// up to the configured grace period.
    pub async fn close(&self) {
        self.inner.state.lock().unwrap().closed = true;
        let _ = self.inner.shutdown.send(true);

        let handle = self.inner.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        info!("Job dispatcher closed");
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut running = JoinSet::new();

        loop {
            let (claimed, next_due) = self.claim_ready();
            for c in claimed {
                let inner = Arc::clone(&self);
                running.spawn(async move {
                    let outcome = execute(&c).await;
                    inner.finish(c.job, outcome);
                });
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep_until_due(next_due) => {}
                Some(_) = running.join_next(), if !running.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        let active = running.len();
        if active > 0 {
            info!(active, "Waiting for active jobs before shutdown");
            let drained = tokio::time::timeout(self.config.shutdown_grace, async {
                while running.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = running.len(),
                    "Shutdown grace period elapsed, aborting active jobs"
                );
                running.abort_all();
            }
        }
    }

    /// Promotes due delayed jobs, then claims as many waiting jobs as
    /// capacity allows. Returns the claims and the next delayed due time.
    fn claim_ready(&self) -> (Vec<Claimed>, Option<Instant>) {
        let handlers = self.handlers.read().unwrap().clone();
        let global = self.config.global_concurrency.max(1);

        let mut guard = self.state.lock().unwrap();
        let DispatchState {
            queues,
            jobs,
            active_total,
            ..
        } = &mut *guard;

        let now = Instant::now();
        let mut claimed = Vec::new();

        for q in queues.iter_mut() {
            while let Some(entry) = q.delayed.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let id = entry.remove();
                if let Some(job) = jobs.get_mut(&id) {
                    job.state = JobState::Waiting;
                    job.run_at = None;
                    q.waiting.insert((Reverse(job.priority), job.seq), id);
                }
            }

            // Queues without a handler keep their jobs waiting.
            let Some(handler) = handlers.get(&q.def.name) else {
                continue;
            };

            while q.active.len() < q.def.concurrency && *active_total < global {
                let Some(entry) = q.waiting.first_entry() else {
                    break;
                };
                let id = entry.remove();
                let Some(job) = jobs.get_mut(&id) else {
                    continue;
                };
                job.state = JobState::Active;
                job.processed_at = Some(Utc::now());
                q.active.insert(id);
                *active_total += 1;

                claimed.push(Claimed {
                    job: job.clone(),
                    handler: Arc::clone(handler),
                    timeout: q.def.policy.timeout,
                });
            }
        }

        let next_due = queues
            .iter()
            .filter_map(|q| q.delayed.keys().next().map(|(at, _)| *at))
            .min();

        (claimed, next_due)
    }

    fn finish(&self, job: Job, outcome: Result<(), JobError>) {
        let event = {
            let mut guard = self.state.lock().unwrap();
            let DispatchState {
                queues,
                jobs,
                unique_keys,
                active_total,
                ..
            } = &mut *guard;

            let Some(q) = queues.iter_mut().find(|q| q.def.name == job.queue) else {
                return;
            };
            if q.active.remove(&job.id) {
                *active_total = active_total.saturating_sub(1);
            }
            let Some(live) = jobs.get_mut(&job.id) else {
                return;
            };

            let retry_delay = match &outcome {
                Ok(()) => None,
                Err(err) => {
                    live.attempts += 1;
                    live.failed_reason = Some(err.message().to_string());
                    if err.is_retryable() && live.attempts < live.max_attempts {
                        let mut delay = live.backoff.delay_for(live.attempts);
                        if q.def.policy.jitter {
                            delay += jitter(delay);
                        }
                        Some(delay)
                    } else {
                        None
                    }
                }
            };

            if let Some(delay) = retry_delay {
                live.state = JobState::Delayed;
                live.run_at = Some(Utc::now() + chrono_duration(delay));
                q.delayed
                    .insert((Instant::now() + delay, live.seq), live.id.clone());
                warn!(
                    job_id = %live.id,
                    queue = %live.queue,
                    attempt = live.attempts,
                    max_attempts = live.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = live.failed_reason.as_deref().unwrap_or_default(),
                    "Job failed, scheduling retry"
                );
                JobEvent::Retrying {
                    job: live.clone(),
                    delay,
                }
            } else {
                let terminal = if outcome.is_ok() {
                    JobState::Completed
                } else {
                    JobState::Failed
                };
                live.state = terminal;
                live.finished_at = Some(Utc::now());
                if let Some(key) = &live.unique_key {
                    if unique_keys.get(key) == Some(&live.id) {
                        unique_keys.remove(key);
                    }
                }
                let snapshot = live.clone();

                match terminal {
                    JobState::Completed => {
                        q.completed_total += 1;
                        debug!(job_id = %snapshot.id, queue = %snapshot.queue, "Job completed");
                    }
                    _ => {
                        q.failed_total += 1;
                        error!(
                            job_id = %snapshot.id,
                            queue = %snapshot.queue,
                            job_type = %snapshot.job_type,
                            attempts = snapshot.attempts,
                            error = snapshot.failed_reason.as_deref().unwrap_or_default(),
                            "Job failed permanently"
                        );
                    }
                }
                q.retain(jobs, snapshot.id.clone(), terminal);

                if terminal == JobState::Completed {
                    JobEvent::Completed(snapshot)
                } else {
                    JobEvent::Failed(snapshot)
                }
            }
        };

        // No subscribers is not an error.
        let _ = self.events.send(event);
        self.notify.notify_one();
    }
}

async fn execute(claimed: &Claimed) -> Result<(), JobError> {
    let attempt = AssertUnwindSafe(claimed.handler.handle(&claimed.job)).catch_unwind();
    match tokio::time::timeout(claimed.timeout, attempt).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(JobError::retryable("job handler panicked")),
        Err(_) => Err(JobError::retryable(format!(
            "job timed out after {}ms",
            claimed.timeout.as_millis()
        ))),
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

fn jitter(delay: Duration) -> Duration {
    let max = (delay.as_millis() as u64) / 10;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
