use std::path::{Path, PathBuf};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::window::DayWindow;

/// Slice of one recording selected for a day's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimmedItem {
    pub path: PathBuf,
    /// Seconds from the start of the file
    pub inpoint: f64,
    /// Seconds from the start of the file; `None` plays to the end
    pub outpoint: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayStatus {
    /// No footage for this day
    Missing,
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl DayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DayStatus::Missing => "MISSING",
            DayStatus::Pending => "PENDING",
            DayStatus::Running => "RUNNING",
            DayStatus::Done => "DONE",
            DayStatus::Failed => "FAILED",
            DayStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Produced duration compared against the expected window length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub expected: f64,
    pub actual: Option<f64>,
    pub delta: Option<f64>,
    pub ok: bool,
}

impl Health {
    pub fn evaluate(expected: f64, actual: Option<f64>, tolerance: f64) -> Self {
        let delta = actual.map(|a| (a - expected).abs());
        Self {
            expected,
            actual,
            delta,
            ok: delta.map(|d| d <= tolerance).unwrap_or(false),
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.actual, self.delta) {
            (Some(actual), Some(delta)) => write!(
                f,
                "duration {:.0}s, expected {:.0}s (off by {:.0}s)",
                actual, self.expected, delta
            ),
            _ => write!(f, "duration unknown, expected {:.0}s", self.expected),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayPlan {
    pub camera_id: u32,
    pub day_index: usize,
    pub window: DayWindow,
    pub status: DayStatus,
    pub items: Vec<TrimmedItem>,
    /// Number of items, kept separately so summaries need not ship the items
    pub segments: usize,
    pub list_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub output_bytes: Option<u64>,
    #[serde(default)]
    pub health: Option<Health>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraPlan {
    pub camera_id: u32,
    #[serde(default)]
    pub warning: Option<String>,
    pub days: Vec<DayPlan>,
}

/// Per-status day counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCounts {
    pub pending: usize,
    pub missing: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl DayCounts {
    pub fn total(&self) -> usize {
        self.pending + self.missing + self.running + self.done + self.failed + self.cancelled
    }
}

/// Everything an encode needs: where each day's manifest lives and where its
/// output goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportPlan {
    pub facility: String,
    pub experiment: String,
    pub treatment: String,
    pub batch: u32,
    /// `<base>/<EXPERIMENT>/<treatment>`
    pub output_dir: PathBuf,
    pub output_extension: String,
    pub windows: Vec<DayWindow>,
    pub health_tolerance_secs: f64,
    pub cameras: Vec<CameraPlan>,
}

impl ImportPlan {
    pub fn days(&self) -> impl Iterator<Item = &DayPlan> {
        self.cameras.iter().flat_map(|c| c.days.iter())
    }

    pub fn counts(&self) -> DayCounts {
        let mut counts = DayCounts::default();
        for day in self.days() {
            match day.status {
                DayStatus::Pending => counts.pending += 1,
                DayStatus::Missing => counts.missing += 1,
                DayStatus::Running => counts.running += 1,
                DayStatus::Done => counts.done += 1,
                DayStatus::Failed => counts.failed += 1,
                DayStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn stem(&self, camera: u32, day: usize) -> String {
        output_stem(&self.experiment, &self.treatment, self.batch, day, camera)
    }

    pub fn list_path(&self, camera: u32, day: usize) -> PathBuf {
        self.output_dir.join(format!("{}.txt", self.stem(camera, day)))
    }

    pub fn output_path(&self, camera: u32, day: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}{}", self.stem(camera, day), self.output_extension))
    }

    /// Copy of the plan without per-item detail, for status payloads
    pub fn summary(&self) -> ImportPlan {
        let mut plan = self.clone();
        for day in plan.cameras.iter_mut().flat_map(|c| c.days.iter_mut()) {
            day.items.clear();
        }
        plan
    }
}

/// `<EXPERIMENT>-<treatment>.exp<batch:04>.day<dd>.cam<cc>`
pub fn output_stem(experiment: &str, treatment: &str, batch: u32, day: usize, camera: u32) -> String {
    format!(
        "{}-{}.exp{:04}.day{:02}.cam{:02}",
        experiment.trim().to_uppercase(),
        treatment.trim().to_lowercase(),
        batch,
        day,
        camera
    )
}

/// Directory that holds every batch of one experiment/treatment
pub fn batch_dir(base: &Path, experiment: &str, treatment: &str) -> PathBuf {
    base.join(experiment.trim().to_uppercase())
        .join(treatment.trim().to_lowercase())
}

/// One past the highest `.expNNNN` batch found in `dir`, or 1
pub fn next_batch_number(dir: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 1;
    };
    let re = match Regex::new(r"(?i)\.exp(\d{4})") {
        Ok(re) => re,
        Err(e) => {
            warn!("Batch pattern failed to compile: {}", e);
            return 1;
        }
    };
    let highest = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            re.captures(&name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
        })
        .max()
        .unwrap_or(0);
    highest + 1
}
