use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Lifecycle of a queued unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }

    /// Status only ever moves forward; terminal states are final
    pub fn can_become(self, next: JobStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared cooperative cancellation flag. Setting it twice is harmless.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl From<bool> for CancelFlag {
    fn from(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }
}

impl Serialize for CancelFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.is_set())
    }
}

impl<'de> Deserialize<'de> for CancelFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        bool::deserialize(deserializer).map(CancelFlag::from)
    }
}

/// A persisted unit of asynchronous work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub title: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub message: String,
    /// Everything a resumer needs to rebuild the runner
    #[serde(default)]
    pub payload: Option<Value>,
    /// Free-form results published by the runner (e.g. the plan)
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub cancel: CancelFlag,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(kind: &str, title: &str, payload: Option<Value>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, title, payload)
    }

    pub fn with_id(id: String, kind: &str, title: &str, payload: Option<Value>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            title: title.to_string(),
            status: JobStatus::Queued,
            progress: 0,
            total: 0,
            message: String::new(),
            payload,
            meta: Map::new(),
            cancel: CancelFlag::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Move to `next` if allowed. Returns false when the move was refused.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        true
    }

    /// Apply a partial update; `meta` keys are merged, not replaced wholesale
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(total) = update.total {
            self.total = total;
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        for (k, v) in update.meta {
            self.meta.insert(k, v);
        }
        if let Some(status) = update.status {
            self.transition(status);
        }
    }

    /// Put an interrupted job back in the queue after a restart
    pub fn requeue_after_restart(&mut self, message: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Queued;
        self.started_at = None;
        self.message = message.to_string();
        true
    }
}

/// Partial job mutation issued by runners and the queue
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u64>,
    pub total: Option<u64>,
    pub message: Option<String>,
    pub meta: Map<String, Value>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, done: u64, total: u64) -> Self {
        self.progress = Some(done);
        self.total = Some(total);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
}

/// Load all persisted jobs. A missing snapshot is an empty registry.
pub fn load_snapshot(path: &Path) -> Result<Vec<Job>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read job snapshot: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job snapshot: {}", path.display()))
}

/// Write the snapshot to a temp file and rename it into place
pub fn save_snapshot(path: &Path, jobs: &[Job]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create job state dir: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(jobs).context("Failed to serialize jobs")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .with_context(|| format!("Failed to write job snapshot: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace job snapshot: {}", path.display()))?;
    Ok(())
}

/// Move an unreadable snapshot aside as `<name>.corrupt-<timestamp>` so a new
/// snapshot does not overwrite it
pub fn quarantine_snapshot(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jobs.json".to_string());
    let aside = path.with_file_name(format!(
        "{}.corrupt-{}",
        name,
        Utc::now().format("%Y%m%dT%H%M%S%3f")
    ));
    fs::rename(path, &aside).with_context(|| {
        format!("Failed to move bad job snapshot {} to {}", path.display(), aside.display())
    })?;
    Ok(aside)
}
