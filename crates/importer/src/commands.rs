use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::config::ImporterConfig;
use crate::import::{self, ImportRequest, JobReport, ENCODE_KIND, SCAN_KIND};
use crate::job::{Job, JobStatus, JobUpdate};
use crate::queue::TaskQueue;

/// What a command file asks the daemon to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandAction {
    Scan { request: ImportRequest },
    /// Encode the plan produced by a finished scan job
    Encode { source_job: String },
    Cancel { target: String },
    CancelAll,
}

/// Command file format shared by the request boundary, the TUI and the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFile {
    #[serde(flatten)]
    pub action: CommandAction,
    /// Id handed to the caller for scan/encode commands
    pub job_id: Option<String>,
    pub timestamp: String,
}

impl CommandFile {
    pub fn new(action: CommandAction) -> Self {
        let job_id = match action {
            CommandAction::Scan { .. } | CommandAction::Encode { .. } => {
                Some(uuid::Uuid::new_v4().to_string())
            }
            _ => None,
        };
        Self { action, job_id, timestamp: Utc::now().to_rfc3339() }
    }
}

/// Drop a command file into `dir` for the daemon to pick up
pub fn submit_command(dir: &Path, cmd: &CommandFile) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create command directory: {}", dir.display()))?;

    let name = format!(
        "{:013}-{}.json",
        Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    );
    let path = dir.join(name);
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(cmd).context("Failed to serialize command")?;
    fs::write(&tmp, content)
        .with_context(|| format!("Failed to write command file: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to move command file into place: {}", path.display()))?;
    debug!("Submitted command {}", path.display());
    Ok(path)
}

/// Read and delete every pending command file, oldest first. Unparseable
/// files are deleted with a warning.
pub fn drain_commands(dir: &Path) -> Result<Vec<CommandFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read command directory: {}", dir.display()))
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut commands = Vec::with_capacity(paths.len());
    for path in paths {
        let parsed = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|c| serde_json::from_str::<CommandFile>(&c).map_err(anyhow::Error::from));
        match parsed {
            Ok(cmd) => commands.push(cmd),
            Err(e) => warn!("Failed to parse command file {}: {}", path.display(), e),
        }
        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
    }
    Ok(commands)
}

/// Apply one command to the queue. Rejected scan/encode commands still leave
/// a FAILED job under their id so a caller polling it learns why.
pub fn dispatch(queue: &TaskQueue, cfg: Arc<ImporterConfig>, cmd: CommandFile) {
    let CommandFile { action, job_id, .. } = cmd;
    match action {
        CommandAction::Scan { request } => match import::prepare(&cfg, &request) {
            Ok(prepared) => {
                let id = import::submit_scan(queue, cfg, prepared, job_id);
                info!("Job {}: scan queued from command file", id);
            }
            Err(e) => {
                warn!("Rejected scan command: {}", e);
                let payload = serde_json::to_value(&request).ok();
                reject(queue, job_id, SCAN_KIND, "scan", payload, e.to_string());
            }
        },
        CommandAction::Encode { source_job } => {
            let plan = queue
                .get(&source_job)
                .filter(|job| job.status == JobStatus::Done)
                .and_then(|job| JobReport::from(&job).plan());
            match plan {
                Some(plan) => {
                    let id = import::submit_encode(queue, cfg, plan, job_id);
                    info!("Job {}: encode of {} queued from command file", id, source_job);
                }
                None => {
                    let reason = format!("No finished plan for job {}", source_job);
                    warn!("Rejected encode command: {}", reason);
                    reject(queue, job_id, ENCODE_KIND, "encode", None, reason);
                }
            }
        }
        CommandAction::Cancel { target } => {
            if !queue.cancel(&target) {
                warn!("Job {}: Not found for cancel command", target);
            }
        }
        CommandAction::CancelAll => {
            let summary = queue.cancel_all();
            info!(
                "Cancel all: {} cancelled, {} already finished",
                summary.cancelled, summary.skipped
            );
        }
    }
}

fn reject(
    queue: &TaskQueue,
    job_id: Option<String>,
    kind: &str,
    title: &str,
    payload: Option<serde_json::Value>,
    reason: String,
) {
    let Some(id) = job_id else {
        return;
    };
    let mut job = Job::with_id(id, kind, title, payload);
    job.apply(JobUpdate::new().status(JobStatus::Failed).message(reason));
    queue.record(job);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::tests::{lab_config, request};
    use crate::queue::tests::wait_terminal;
    use crate::plan::ImportPlan;

    #[test]
    fn test_command_file_format() {
        let cmd = CommandFile::new(CommandAction::Cancel { target: "abc".into() });
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["action"], "cancel");
        assert_eq!(value["target"], "abc");
        assert!(cmd.job_id.is_none());

        let cmd = CommandFile::new(CommandAction::CancelAll);
        assert_eq!(serde_json::to_value(&cmd).unwrap()["action"], "cancel_all");

        let cmd = CommandFile::new(CommandAction::Scan { request: request() });
        assert!(cmd.job_id.is_some());
        let back: CommandFile = serde_json::from_value(serde_json::to_value(&cmd).unwrap()).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_drain_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let cmds = dir.path().join("commands");
        assert!(drain_commands(&cmds).unwrap().is_empty());

        for target in ["a", "b", "c"] {
            submit_command(&cmds, &CommandFile::new(CommandAction::Cancel { target: target.into() })).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        fs::write(cmds.join("zzz.json"), "not json").unwrap();
        fs::write(cmds.join("partial.json.tmp"), "{").unwrap();

        let drained = drain_commands(&cmds).unwrap();
        let targets: Vec<_> = drained
            .iter()
            .map(|c| match &c.action {
                CommandAction::Cancel { target } => target.as_str(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(targets, vec!["a", "b", "c"]);

        let left: Vec<_> = fs::read_dir(&cmds).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(left, vec![std::ffi::OsString::from("partial.json.tmp")]);
    }

    #[tokio::test]
    async fn test_dispatch_scan_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(lab_config(dir.path()));
        let queue = TaskQueue::ephemeral();
        queue.start();

        let cmd = CommandFile::new(CommandAction::Scan { request: request() });
        let id = cmd.job_id.clone().unwrap();
        dispatch(&queue, cfg.clone(), cmd);

        let job = wait_terminal(&queue, &id).await;
        assert_eq!(job.kind, SCAN_KIND);
        assert_eq!(job.status, JobStatus::Done);

        // Encode of the finished scan: every day is missing, nothing to run
        let cmd = CommandFile::new(CommandAction::Encode { source_job: id.clone() });
        let encode_id = cmd.job_id.clone().unwrap();
        dispatch(&queue, cfg, cmd);
        let job = wait_terminal(&queue, &encode_id).await;
        assert_eq!(job.kind, ENCODE_KIND);
        assert_eq!(job.status, JobStatus::Done);
        let plan: ImportPlan = serde_json::from_value(job.meta["plan"].clone()).unwrap();
        assert_eq!(plan.counts().missing, 4);
    }

    #[test]
    fn test_dispatch_rejections_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(lab_config(dir.path()));
        let queue = TaskQueue::ephemeral();

        let mut req = request();
        req.facility = "nowhere".into();
        let cmd = CommandFile::new(CommandAction::Scan { request: req });
        let id = cmd.job_id.clone().unwrap();
        dispatch(&queue, cfg.clone(), cmd);
        let job = queue.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.message.contains("nowhere"));

        let cmd = CommandFile::new(CommandAction::Encode { source_job: "missing".into() });
        let id = cmd.job_id.clone().unwrap();
        dispatch(&queue, cfg, cmd);
        assert_eq!(queue.get(&id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_dispatch_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(lab_config(dir.path()));
        let queue = TaskQueue::ephemeral();
        let id = queue.enqueue("noop", "noop", None, crate::queue::runner(|_| async { Ok(()) }));

        dispatch(&queue, cfg.clone(), CommandFile::new(CommandAction::Cancel { target: id.clone() }));
        assert!(queue.get(&id).unwrap().cancel.is_set());
        dispatch(&queue, cfg, CommandFile::new(CommandAction::CancelAll));
    }
}
