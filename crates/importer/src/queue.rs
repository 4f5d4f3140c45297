use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::Result;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use crate::job::{load_snapshot, quarantine_snapshot, save_snapshot, CancelFlag, Job, JobStatus, JobUpdate};

/// Finished jobs kept in the registry and snapshot unless configured otherwise
pub const DEFAULT_RETAINED_JOBS: usize = 500;

pub type RunFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Work attached to one queued job
pub type Runner = Box<dyn FnOnce(JobContext) -> RunFuture + Send>;

/// Rebuilds a runner from a job's persisted payload
pub type Resumer = Arc<dyn Fn(Value) -> Result<Runner> + Send + Sync>;

/// Wrap an async closure as a [`Runner`]
pub fn runner<F, Fut>(f: F) -> Runner
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    pub cancelled: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResumeSummary {
    pub resumed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// Insertion order, oldest first
    order: Vec<String>,
    queue: VecDeque<String>,
    runners: HashMap<String, Runner>,
    resumers: HashMap<String, Resumer>,
    worker_started: bool,
    resumed: bool,
    /// Finished jobs to keep; 0 keeps all
    retain_finished: usize,
}

impl QueueState {
    fn ordered_jobs(&self) -> Vec<Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id)).cloned().collect()
    }

    /// Drop the oldest finished jobs beyond the retention cap
    fn prune_finished(&mut self) -> usize {
        if self.retain_finished == 0 {
            return 0;
        }
        let finished: Vec<&String> = self
            .order
            .iter()
            .filter(|id| self.jobs.get(*id).map(|j| j.status.is_terminal()).unwrap_or(false))
            .collect();
        let excess = finished.len().saturating_sub(self.retain_finished);
        if excess == 0 {
            return 0;
        }
        let dropped: HashSet<String> = finished.into_iter().take(excess).cloned().collect();
        self.order.retain(|id| !dropped.contains(id));
        self.queue.retain(|id| !dropped.contains(id));
        for id in &dropped {
            self.jobs.remove(id);
            self.runners.remove(id);
        }
        excess
    }
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    state_file: Option<PathBuf>,
}

/// Durable single-worker job queue.
///
/// Jobs run strictly one at a time in FIFO order. Every mutation is written to
/// the snapshot file while the registry lock is held.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Open a queue backed by `state_file`, loading any persisted jobs.
    /// Loaded jobs are not runnable until [`TaskQueue::resume_pending`].
    ///
    /// An unreadable snapshot is moved aside and the queue starts empty. If it
    /// cannot be moved, the queue runs without persistence rather than
    /// overwrite it.
    pub fn open(state_file: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();
        let mut persist_to = Some(state_file.clone());
        let mut jobs = match load_snapshot(&state_file) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Failed to load job snapshot: {:#}", e);
                match quarantine_snapshot(&state_file) {
                    Ok(aside) => error!("Bad job snapshot kept at {}, starting empty", aside.display()),
                    Err(e) => {
                        error!("{:#}; job persistence disabled for this run", e);
                        persist_to = None;
                    }
                }
                Vec::new()
            }
        };
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        info!("Loaded {} jobs from {}", jobs.len(), state_file.display());
        Self::with_jobs(jobs, persist_to)
    }

    /// A queue that never touches disk
    pub fn ephemeral() -> Self {
        Self::with_jobs(Vec::new(), None)
    }

    fn with_jobs(jobs: Vec<Job>, state_file: Option<PathBuf>) -> Self {
        let mut state = QueueState { retain_finished: DEFAULT_RETAINED_JOBS, ..Default::default() };
        for job in jobs {
            state.order.push(job.id.clone());
            state.jobs.insert(job.id.clone(), job);
        }
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                notify: Notify::new(),
                state_file,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persistence failures are logged and swallowed; memory stays authoritative
    fn persist(&self, state: &mut QueueState) {
        let pruned = state.prune_finished();
        if pruned > 0 {
            debug!("Dropped {} old finished job(s)", pruned);
        }
        let Some(path) = &self.inner.state_file else {
            return;
        };
        if let Err(e) = save_snapshot(path, &state.ordered_jobs()) {
            warn!("Failed to persist job snapshot: {:#}", e);
        }
    }

    /// Keep at most `finished` terminal jobs, oldest dropped first; 0 keeps all
    pub fn set_retention(&self, finished: usize) {
        let mut state = self.lock();
        state.retain_finished = finished;
        self.persist(&mut state);
    }

    pub fn register_resumer(&self, kind: &str, resumer: Resumer) {
        self.lock().resumers.insert(kind.to_string(), resumer);
    }

    /// Queue a new job and return its id
    pub fn enqueue(&self, kind: &str, title: &str, payload: Option<Value>, run: Runner) -> String {
        self.enqueue_job(Job::new(kind, title, payload), run)
    }

    /// Queue a prepared job (e.g. one whose id was handed out earlier)
    pub fn enqueue_job(&self, job: Job, run: Runner) -> String {
        let id = job.id.clone();
        {
            let mut state = self.lock();
            if state.jobs.contains_key(&id) {
                warn!("Job {}: already registered, not queueing again", id);
                return id;
            }
            info!("Job {}: queued {} ({})", id, job.kind, job.title);
            state.order.push(id.clone());
            state.jobs.insert(id.clone(), job);
            state.runners.insert(id.clone(), run);
            state.queue.push_back(id.clone());
            self.persist(&mut state);
        }
        self.inner.notify.notify_one();
        id
    }

    /// Register a job that has no runner, e.g. a request rejected after its id
    /// was handed out
    pub fn record(&self, job: Job) {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return;
        }
        state.order.push(job.id.clone());
        state.jobs.insert(job.id.clone(), job);
        self.persist(&mut state);
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    /// Newest first; `limit` of 0 means no limit
    pub fn list(&self, active_only: bool, limit: usize) -> Vec<Job> {
        let state = self.lock();
        let jobs = state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.jobs.get(id))
            .filter(|j| !active_only || j.is_active())
            .cloned();
        if limit == 0 { jobs.collect() } else { jobs.take(limit).collect() }
    }

    pub fn update(&self, id: &str, update: JobUpdate) -> bool {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return false;
        };
        job.apply(update);
        self.persist(&mut state);
        true
    }

    /// Request cancellation. Fire-and-forget: the runner notices at its next
    /// safe point. Returns false for unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return false;
        };
        if !job.cancel.is_set() {
            info!("Job {}: cancel requested", id);
            job.cancel.set();
        }
        self.persist(&mut state);
        true
    }

    /// Cancel every active job; terminal jobs are counted as skipped
    pub fn cancel_all(&self) -> CancelSummary {
        let mut state = self.lock();
        let mut summary = CancelSummary::default();
        for job in state.jobs.values_mut() {
            if job.status.is_terminal() {
                summary.skipped += 1;
            } else {
                job.cancel.set();
                summary.cancelled += 1;
            }
        }
        info!("Cancel all: {} cancelled, {} skipped", summary.cancelled, summary.skipped);
        self.persist(&mut state);
        summary
    }

    /// Rebuild runners for jobs left unfinished by a previous process.
    ///
    /// Runs once; later calls return an empty summary.
    pub fn resume_pending(&self) -> ResumeSummary {
        let mut summary = ResumeSummary::default();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.resumed {
                return summary;
            }
            state.resumed = true;

            let mut pending: Vec<String> = state
                .order
                .iter()
                .filter(|id| state.jobs.get(*id).map(|j| j.is_active()).unwrap_or(false))
                .filter(|id| !state.runners.contains_key(*id))
                .cloned()
                .collect();
            pending.sort_by_key(|id| state.jobs.get(id).map(|j| j.created_at));

            for id in pending {
                let Some(job) = state.jobs.get_mut(&id) else { continue };
                let resumer = state.resumers.get(&job.kind).cloned();
                let payload = job.payload.clone().filter(|p| match p {
                    Value::Null => false,
                    Value::Object(map) => !map.is_empty(),
                    _ => true,
                });

                let verdict = if job.cancel.is_set() {
                    Err((JobStatus::Cancelled, "Cancelled before restart".to_string()))
                } else if let Some(resumer) = resumer {
                    match payload {
                        Some(payload) => resumer(payload)
                            .map_err(|e| (JobStatus::Failed, format!("Cannot resume: {:#}", e))),
                        None => Err((JobStatus::Cancelled, "Missing task payload for resume".to_string())),
                    }
                } else {
                    Err((JobStatus::Cancelled, "No resume handler for task kind".to_string()))
                };

                match verdict {
                    Ok(run) => {
                        job.requeue_after_restart("Resuming after restart");
                        info!("Job {}: resuming {} after restart", id, job.kind);
                        state.runners.insert(id.clone(), run);
                        state.queue.push_back(id.clone());
                        summary.resumed += 1;
                    }
                    Err((status, message)) => {
                        warn!("Job {}: {} ({})", id, message, job.kind);
                        job.apply(JobUpdate::new().status(status).message(message));
                        match status {
                            JobStatus::Failed => summary.failed += 1,
                            _ => summary.cancelled += 1,
                        }
                    }
                }
            }
            self.persist(state);
        }
        if summary.resumed > 0 {
            self.inner.notify.notify_one();
        }
        summary
    }

    /// Spawn the worker task. Only the first call starts one.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        {
            let mut state = self.lock();
            if state.worker_started {
                return None;
            }
            state.worker_started = true;
        }
        let queue = self.clone();
        Some(tokio::spawn(async move { queue.worker_loop().await }))
    }

    async fn worker_loop(self) {
        info!("Task worker started");
        loop {
            match self.next_runnable() {
                Some((id, run, cancel)) => self.run_job(id, run, cancel).await,
                None => self.inner.notify.notified().await,
            }
        }
    }

    /// Pop the next job and mark it RUNNING. Jobs cancelled while queued are
    /// finished here without running.
    fn next_runnable(&self) -> Option<(String, Runner, CancelFlag)> {
        let mut state = self.lock();
        while let Some(id) = state.queue.pop_front() {
            let run = state.runners.remove(&id);
            let Some(job) = state.jobs.get_mut(&id) else { continue };
            let Some(run) = run else { continue };

            if job.cancel.is_set() {
                info!("Job {}: cancelled before start", id);
                job.apply(JobUpdate::new().status(JobStatus::Cancelled).message("Cancelled before start"));
                self.persist(&mut state);
                continue;
            }
            if !job.transition(JobStatus::Running) {
                continue;
            }
            let cancel = job.cancel.clone();
            info!("Job {}: ▶️  running {} ({})", id, job.kind, job.title);
            self.persist(&mut state);
            return Some((id, run, cancel));
        }
        None
    }

    async fn run_job(&self, id: String, run: Runner, cancel: CancelFlag) {
        let ctx = JobContext { queue: self.clone(), job_id: id.clone(), cancel: cancel.clone() };
        let outcome = tokio::spawn(run(ctx)).await;

        let update = match outcome {
            Ok(Ok(())) if cancel.is_set() => JobUpdate::new().status(JobStatus::Cancelled),
            Ok(Ok(())) => JobUpdate::new().status(JobStatus::Done),
            Ok(Err(e)) if cancel.is_set() => {
                info!("Job {}: stopped after cancel: {:#}", id, e);
                JobUpdate::new().status(JobStatus::Cancelled).message(format!("Cancelled: {:#}", e))
            }
            Ok(Err(e)) => {
                error!("Job {}: ❌ failed: {:#}", id, e);
                JobUpdate::new().status(JobStatus::Failed).message(format!("{:#}", e))
            }
            Err(join) if join.is_panic() => {
                let panic = join.into_panic();
                let text = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Job {}: ❌ runner panicked: {}", id, text);
                JobUpdate::new().status(JobStatus::Failed).message(format!("Runner panicked: {}", text))
            }
            Err(_) => JobUpdate::new().status(JobStatus::Failed).message("Runner aborted"),
        };

        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&id) {
            // A runner that already set a terminal status keeps it
            if !job.status.is_terminal() {
                job.apply(update);
            }
            info!("Job {}: finished with status {}", id, job.status);
        }
        self.persist(&mut state);
    }
}

/// Handle given to a running job
#[derive(Clone)]
pub struct JobContext {
    queue: TaskQueue,
    job_id: String,
    cancel: CancelFlag,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_set()
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn set_progress(&self, done: u64, total: u64) {
        self.queue.update(&self.job_id, JobUpdate::new().progress(done, total));
    }

    pub fn update(&self, update: JobUpdate) {
        self.queue.update(&self.job_id, update);
    }

    pub fn snapshot(&self) -> Option<Job> {
        self.queue.get(&self.job_id)
    }

    /// The queue this job runs on, for jobs that schedule follow-up work
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    pub(crate) async fn wait_terminal(queue: &TaskQueue, id: &str) -> Job {
        for _ in 0..500 {
            if let Some(job) = queue.get(id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish: {:?}", id, queue.get(id));
    }

    #[tokio::test]
    async fn test_jobs_run_sequentially_in_order() {
        let queue = TaskQueue::ephemeral();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut ids = Vec::new();
        for i in 0..3 {
            let log = log.clone();
            ids.push(queue.enqueue("test", &format!("job {}", i), None, runner(move |ctx| async move {
                log.lock().unwrap().push(format!("start {}", i));
                ctx.set_progress(1, 2);
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push(format!("end {}", i));
                Ok(())
            })));
        }
        queue.start();
        assert!(queue.start().is_none());

        for id in &ids {
            let job = wait_terminal(&queue, id).await;
            assert_eq!(job.status, JobStatus::Done);
            assert_eq!((job.progress, job.total), (1, 2));
            assert!(job.started_at.is_some() && job.finished_at.is_some());
        }
        let log = log.lock().unwrap().clone();
        assert_eq!(log, vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]);
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_stop_worker() {
        let queue = TaskQueue::ephemeral();
        queue.start();

        let failing = queue.enqueue("test", "fails", None, runner(|_| async {
            anyhow::bail!("disk full")
        }));
        let panicking = queue.enqueue("test", "panics", None, runner(|_| async {
            panic!("boom");
        }));
        let fine = queue.enqueue("test", "fine", None, runner(|_| async { Ok(()) }));

        let job = wait_terminal(&queue, &failing).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.message.contains("disk full"));

        let job = wait_terminal(&queue, &panicking).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.message.contains("boom"));

        assert_eq!(wait_terminal(&queue, &fine).await.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running_jobs() {
        let queue = TaskQueue::ephemeral();
        let blocker = queue.enqueue("test", "long", None, runner(|ctx| async move {
            while !ctx.cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }));
        let ran = Arc::new(Mutex::new(false));
        let ran_flag = ran.clone();
        let waiting = queue.enqueue("test", "never", None, runner(move |_| async move {
            *ran_flag.lock().unwrap() = true;
            Ok(())
        }));

        assert!(queue.cancel(&waiting));
        assert!(queue.cancel(&waiting));
        assert!(!queue.cancel("no-such-job"));
        queue.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.get(&blocker).unwrap().status, JobStatus::Running);
        queue.cancel(&blocker);

        assert_eq!(wait_terminal(&queue, &blocker).await.status, JobStatus::Cancelled);
        let job = wait_terminal(&queue, &waiting).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.message, "Cancelled before start");
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_runner_terminal_status_is_kept() {
        let queue = TaskQueue::ephemeral();
        queue.start();
        let id = queue.enqueue("test", "self-finishing", None, runner(|ctx| async move {
            ctx.update(JobUpdate::new().status(JobStatus::Cancelled).message("stopped early"));
            ctx.update(JobUpdate::new().status(JobStatus::Done));
            Ok(())
        }));
        let job = wait_terminal(&queue, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.message, "stopped early");
    }

    #[tokio::test]
    async fn test_restart_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("jobs.json");

        let mut orphan = Job::new("legacy.kind", "orphan", Some(json!({"x": 1})));
        orphan.transition(JobStatus::Running);
        let resumable = Job::new("resumable", "resume me", Some(json!({"n": 7})));
        let no_payload = Job::new("resumable", "empty", None);
        let broken = Job::new("resumable", "broken", Some(json!("not an object")));
        let flagged = Job::new("resumable", "flagged", Some(json!({"n": 1})));
        flagged.cancel.set();
        let mut finished = Job::new("resumable", "done", Some(json!({"n": 2})));
        finished.transition(JobStatus::Done);
        save_snapshot(
            &state_file,
            &[orphan.clone(), resumable.clone(), no_payload.clone(), broken.clone(), flagged.clone(), finished.clone()],
        )
        .unwrap();

        let queue = TaskQueue::open(&state_file);
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        queue.register_resumer("resumable", Arc::new(move |payload: Value| -> Result<Runner> {
            let n = payload
                .get("n")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow::anyhow!("payload has no n"))?;
            let seen = seen_in.clone();
            Ok(runner(move |_| async move {
                *seen.lock().unwrap() = Some(n);
                Ok(())
            }))
        }));

        let summary = queue.resume_pending();
        assert_eq!(summary, ResumeSummary { resumed: 1, cancelled: 3, failed: 1 });
        assert_eq!(queue.resume_pending(), ResumeSummary::default());

        let job = queue.get(&orphan.id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.message, "No resume handler for task kind");
        assert!(job.finished_at.is_some());
        assert_eq!(queue.get(&no_payload.id).unwrap().message, "Missing task payload for resume");
        assert_eq!(queue.get(&flagged.id).unwrap().message, "Cancelled before restart");
        assert_eq!(queue.get(&broken.id).unwrap().status, JobStatus::Failed);
        assert_eq!(queue.get(&finished.id).unwrap().status, JobStatus::Done);
        assert_eq!(queue.get(&resumable.id).unwrap().message, "Resuming after restart");

        queue.start();
        assert_eq!(wait_terminal(&queue, &resumable.id).await.status, JobStatus::Done);
        assert_eq!(*seen.lock().unwrap(), Some(7));

        // Everything above survived to disk
        let reloaded = TaskQueue::open(&state_file);
        assert_eq!(reloaded.list(false, 0).len(), 6);
        assert_eq!(reloaded.get(&resumable.id).unwrap().status, JobStatus::Done);
        assert!(reloaded.list(true, 0).is_empty());
    }

    #[tokio::test]
    async fn test_list_and_cancel_all() {
        let queue = TaskQueue::ephemeral();
        let a = queue.enqueue("test", "a", None, runner(|_| async { Ok(()) }));
        let b = queue.enqueue("test", "b", None, runner(|_| async { Ok(()) }));
        queue.update(&a, JobUpdate::new().status(JobStatus::Failed).message("x"));

        let listed: Vec<String> = queue.list(false, 0).into_iter().map(|j| j.id).collect();
        assert_eq!(listed, vec![b.clone(), a.clone()]);
        assert_eq!(queue.list(false, 1).len(), 1);
        assert_eq!(queue.list(true, 0).len(), 1);

        let summary = queue.cancel_all();
        assert_eq!(summary, CancelSummary { cancelled: 1, skipped: 1 });
        assert!(queue.get(&b).unwrap().cancel.is_set());
    }

    #[test]
    fn test_corrupt_snapshot_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("jobs.json");
        std::fs::write(&state_file, "{not json").unwrap();
        let queue = TaskQueue::open(&state_file);
        assert!(queue.list(false, 0).is_empty());

        queue.enqueue("test", "after", None, runner(|_| async { Ok(()) }));
        assert_eq!(load_snapshot(&state_file).unwrap().len(), 1);

        let aside: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("jobs.json.corrupt-"))
            .collect();
        assert_eq!(aside.len(), 1);
        assert_eq!(std::fs::read_to_string(&aside[0]).unwrap(), "{not json");
    }

    #[tokio::test]
    async fn test_error_after_cancel_is_cancelled() {
        let queue = TaskQueue::ephemeral();
        let id = queue.enqueue("test", "interrupted", None, runner(|ctx| async move {
            while !ctx.cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err::<(), _>(anyhow::anyhow!("encoder interrupted"))
        }));
        queue.start();
        for _ in 0..500 {
            if queue.get(&id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.get(&id).unwrap().status, JobStatus::Running);
        assert!(queue.cancel(&id));

        let job = wait_terminal(&queue, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.message.contains("encoder interrupted"));
    }

    #[test]
    fn test_finished_jobs_beyond_retention_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("jobs.json");
        let queue = TaskQueue::open(&state_file);

        let active = queue.enqueue("test", "waiting", None, runner(|_| async { Ok(()) }));
        let mut finished = Vec::new();
        for i in 0..4 {
            let mut job = Job::new("test", &format!("done {}", i), None);
            job.apply(JobUpdate::new().status(JobStatus::Failed).message("x"));
            finished.push(job.id.clone());
            queue.record(job);
        }
        assert_eq!(queue.list(false, 0).len(), 5);

        queue.set_retention(2);
        let kept: Vec<String> = queue.list(false, 0).into_iter().map(|j| j.id).collect();
        assert_eq!(kept, vec![finished[3].clone(), finished[2].clone(), active.clone()]);
        assert!(queue.get(&finished[0]).is_none());
        assert_eq!(load_snapshot(&state_file).unwrap().len(), 3);

        // Each new finished job pushes the oldest one out
        let mut job = Job::new("test", "done 4", None);
        job.apply(JobUpdate::new().status(JobStatus::Failed).message("x"));
        queue.record(job);
        assert!(queue.get(&finished[2]).is_none());
        assert_eq!(queue.list(false, 0).len(), 3);
        assert!(queue.get(&active).is_some());
    }
}
