use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::config::{Facility, ImporterConfig};
use crate::encode;
use crate::error::ImportError;
use crate::job::{Job, JobStatus};
use crate::plan::{batch_dir, next_batch_number, ImportPlan};
use crate::queue::{Resumer, Runner, TaskQueue};
use crate::scan;
use crate::window::{day_windows, DayWindow};

pub const SCAN_KIND: &str = "import.scan";
pub const ENCODE_KIND: &str = "import.encode";

/// What the operator asked for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportRequest {
    pub facility: String,
    pub experiment: String,
    pub treatment: String,
    /// Resolved to the next free batch number when absent
    pub batch: Option<u32>,
    /// `YYYY-MM-DD`
    pub start_date: String,
    pub end_date: String,
    /// `H:MM`
    pub start_time: String,
    pub end_time: String,
    /// Empty means every camera of the facility
    pub cameras: Vec<u32>,
    pub camera_pattern: Option<String>,
    pub path_time_regex: Option<String>,
    /// Queue the encode job as soon as the scan finishes
    pub auto_encode: bool,
}

/// A request that passed validation, ready to become a scan job
#[derive(Debug, Clone)]
pub struct PreparedImport {
    /// The request with batch and cameras filled in
    pub request: ImportRequest,
    pub facility: Facility,
    pub windows: Vec<DayWindow>,
    pub cameras: Vec<u32>,
    pub batch: u32,
    pub output_dir: PathBuf,
}

impl PreparedImport {
    pub fn title(&self) -> String {
        format!(
            "{} {}-{} exp{:04} ({} -> {})",
            self.facility.name,
            self.request.experiment.trim().to_uppercase(),
            self.request.treatment.trim().to_lowercase(),
            self.batch,
            self.request.start_date,
            self.request.end_date
        )
    }

    /// Empty plan skeleton the scan fills in
    pub fn empty_plan(&self, output_extension: &str) -> ImportPlan {
        ImportPlan {
            facility: self.facility.name.clone(),
            experiment: self.request.experiment.trim().to_uppercase(),
            treatment: self.request.treatment.trim().to_lowercase(),
            batch: self.batch,
            output_dir: self.output_dir.clone(),
            output_extension: output_extension.to_string(),
            windows: self.windows.clone(),
            health_tolerance_secs: self.facility.health_tolerance_secs,
            cameras: Vec::new(),
        }
    }
}

/// Validate a request against the configuration. Nothing is queued and
/// nothing touches disk beyond reading directories.
pub fn prepare(cfg: &ImporterConfig, req: &ImportRequest) -> Result<PreparedImport, ImportError> {
    let mut facility = cfg.facility(&req.facility)?;

    if req.experiment.trim().is_empty() {
        return Err(ImportError::MissingField("experiment"));
    }
    if req.treatment.trim().is_empty() {
        return Err(ImportError::MissingField("treatment"));
    }

    let windows = day_windows(&req.start_date, &req.end_date, &req.start_time, &req.end_time)?;

    let mut cameras: Vec<u32> = req.cameras.clone();
    cameras.sort_unstable();
    cameras.dedup();
    if cameras.is_empty() {
        cameras = facility.camera_list.clone();
    }
    if cameras.is_empty() {
        return Err(ImportError::NoCameras);
    }
    if !facility.camera_list.is_empty() {
        let rejected: Vec<u32> = cameras
            .iter()
            .copied()
            .filter(|c| !facility.camera_list.contains(c))
            .collect();
        if !rejected.is_empty() {
            return Err(ImportError::CamerasNotAllowed {
                requested: rejected,
                allowed: facility.camera_list.clone(),
            });
        }
    }

    if let Some(pattern) = &req.camera_pattern {
        facility.set_camera_pattern(pattern);
    }
    if let Some(regex) = req.path_time_regex.as_deref().filter(|r| !r.trim().is_empty()) {
        facility.set_path_time_regex(regex)?;
    }

    if !facility.source_dir.is_dir() {
        return Err(ImportError::SourceMissing(facility.source_dir.clone()));
    }

    let output_dir = batch_dir(&facility.output_dir, &req.experiment, &req.treatment);
    let batch = match req.batch {
        Some(b) if b > 0 => b,
        _ => next_batch_number(&output_dir),
    };

    let mut request = req.clone();
    request.facility = facility.name.clone();
    request.batch = Some(batch);
    request.cameras = cameras.clone();

    Ok(PreparedImport { request, facility, windows, cameras, batch, output_dir })
}

/// Queue a scan for a validated request. `job_id` lets a caller that already
/// handed out an id keep it.
pub fn submit_scan(
    queue: &TaskQueue,
    cfg: Arc<ImporterConfig>,
    prepared: PreparedImport,
    job_id: Option<String>,
) -> String {
    let payload = serde_json::to_value(&prepared.request).ok();
    let title = prepared.title();
    let job = match job_id {
        Some(id) => Job::with_id(id, SCAN_KIND, &title, payload),
        None => Job::new(SCAN_KIND, &title, payload),
    };
    info!("Submitting scan: {}", title);
    queue.enqueue_job(job, scan::scan_runner(cfg, prepared))
}

/// Queue an encode of a finished plan
pub fn submit_encode(
    queue: &TaskQueue,
    cfg: Arc<ImporterConfig>,
    plan: ImportPlan,
    job_id: Option<String>,
) -> String {
    let payload = serde_json::to_value(encode::EncodePayload { plan: plan.summary() }).ok();
    let title = format!("encode {}-{} exp{:04}", plan.experiment, plan.treatment, plan.batch);
    let job = match job_id {
        Some(id) => Job::with_id(id, ENCODE_KIND, &title, payload),
        None => Job::new(ENCODE_KIND, &title, payload),
    };
    queue.enqueue_job(job, encode::encode_runner(cfg, plan))
}

/// Teach the queue how to rebuild scan and encode jobs after a restart
pub fn register_resumers(queue: &TaskQueue, cfg: Arc<ImporterConfig>) {
    let scan_cfg = cfg.clone();
    let scan_resumer: Resumer = Arc::new(move |payload: Value| -> anyhow::Result<Runner> {
        let request: ImportRequest = serde_json::from_value(payload)?;
        let prepared = prepare(&scan_cfg, &request)?;
        Ok(scan::scan_runner(scan_cfg.clone(), prepared))
    });
    queue.register_resumer(SCAN_KIND, scan_resumer);

    let encode_resumer: Resumer = Arc::new(move |payload: Value| -> anyhow::Result<Runner> {
        let payload: encode::EncodePayload = serde_json::from_value(payload)?;
        Ok(encode::encode_runner(cfg.clone(), payload.plan))
    });
    queue.register_resumer(ENCODE_KIND, encode_resumer);
}

/// Polling surface for one job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub status: JobStatus,
    pub progress: u64,
    pub total: u64,
    pub message: String,
    pub cancel_requested: bool,
    pub plan: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobReport {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind.clone(),
            title: job.title.clone(),
            status: job.status,
            progress: job.progress,
            total: job.total,
            message: job.message.clone(),
            cancel_requested: job.cancel.is_set(),
            plan: job.meta.get("plan").cloned(),
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

impl JobReport {
    pub fn plan(&self) -> Option<ImportPlan> {
        self.plan.clone().and_then(|p| serde_json::from_value(p).ok())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FacilityConfig;
    use std::path::Path;

    pub(crate) fn lab_config(root: &Path) -> ImporterConfig {
        let mut cfg = ImporterConfig::default_config();
        cfg.working_dir = root.join("working");
        cfg.job_state_dir = root.join("working/jobs");
        cfg.facilities.insert(
            "Lab".to_string(),
            FacilityConfig {
                source_dir: root.join("source"),
                camera_list: vec![1, 2],
                camera_pattern: "cam{cam:02d}".to_string(),
                probe_segments: Some(false),
                ..Default::default()
            },
        );
        std::fs::create_dir_all(root.join("source")).unwrap();
        cfg
    }

    pub(crate) fn request() -> ImportRequest {
        ImportRequest {
            facility: "lab".to_string(),
            experiment: "cage".to_string(),
            treatment: "Ctrl".to_string(),
            start_date: "2024-03-01".to_string(),
            end_date: "2024-03-02".to_string(),
            start_time: "08:00".to_string(),
            end_time: "18:00".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = lab_config(dir.path());
        let prepared = prepare(&cfg, &request()).unwrap();

        assert_eq!(prepared.cameras, vec![1, 2]);
        assert_eq!(prepared.batch, 1);
        assert_eq!(prepared.windows.len(), 2);
        assert_eq!(prepared.output_dir, dir.path().join("working/CAGE/ctrl"));
        assert_eq!(prepared.request.batch, Some(1));
        assert_eq!(prepared.request.cameras, vec![1, 2]);
    }

    #[test]
    fn test_prepare_picks_next_batch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = lab_config(dir.path());
        let out = dir.path().join("working/CAGE/ctrl");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("CAGE-ctrl.exp0004.day01.cam01.mp4"), b"").unwrap();
        assert_eq!(prepare(&cfg, &request()).unwrap().batch, 5);

        let mut req = request();
        req.batch = Some(2);
        assert_eq!(prepare(&cfg, &req).unwrap().batch, 2);
    }

    #[test]
    fn test_prepare_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = lab_config(dir.path());

        let mut req = request();
        req.facility = "nowhere".into();
        assert!(matches!(prepare(&cfg, &req), Err(ImportError::UnknownFacility(_))));

        let mut req = request();
        req.experiment = " ".into();
        assert!(matches!(prepare(&cfg, &req), Err(ImportError::MissingField("experiment"))));

        let mut req = request();
        req.end_date = "2024-02-01".into();
        assert!(matches!(prepare(&cfg, &req), Err(ImportError::InvalidRange(_))));

        let mut req = request();
        req.cameras = vec![2, 9];
        match prepare(&cfg, &req) {
            Err(ImportError::CamerasNotAllowed { requested, allowed }) => {
                assert_eq!(requested, vec![9]);
                assert_eq!(allowed, vec![1, 2]);
            }
            other => panic!("unexpected: {:?}", other.map(|p| p.cameras)),
        }

        let mut req = request();
        req.path_time_regex = Some("(?P<year>".into());
        assert!(matches!(prepare(&cfg, &req), Err(ImportError::InvalidRegex { .. })));

        std::fs::remove_dir_all(dir.path().join("source")).unwrap();
        assert!(matches!(prepare(&cfg, &request()), Err(ImportError::SourceMissing(_))));
    }

    #[test]
    fn test_prepare_without_cameras() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = lab_config(dir.path());
        if let Some(fac) = cfg.facilities.get_mut("Lab") {
            fac.camera_list.clear();
        }
        assert!(matches!(prepare(&cfg, &request()), Err(ImportError::NoCameras)));
    }

    #[test]
    fn test_request_roundtrips_as_payload() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = lab_config(dir.path());
        let prepared = prepare(&cfg, &request()).unwrap();
        let value = serde_json::to_value(&prepared.request).unwrap();
        let back: ImportRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, prepared.request);
        assert_eq!(prepare(&cfg, &back).unwrap().batch, prepared.batch);
    }
}
