use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::config::{Facility, MAX_FILE_DURATION_LIMIT_SECS};
use crate::error::ImportError;
use crate::job::CancelFlag;
use crate::probe::MediaProbe;
use crate::walk::{walk_files, MediaFilter, WalkSummary};
use crate::window::secs_between;

/// One recording file and the wall-clock span it is believed to cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSegment {
    pub path: PathBuf,
    pub camera_id: u32,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl RawSegment {
    pub fn duration_secs(&self) -> f64 {
        secs_between(self.start, self.end)
    }
}

/// Where a segment's start time came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartSource {
    EpochMillis,
    StemSeconds,
    PathRegex,
    ModifiedTime,
}

/// Parse `<camera>-<YYYYMMDD>-<HHMMSS>[-<epoch_ms>[-<seq>]]`.
///
/// A 13+ digit epoch token wins and is converted to local wall-clock time;
/// otherwise the date and time fields give second precision.
pub fn parse_start_from_stem(stem: &str) -> Option<(NaiveDateTime, StartSource)> {
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    let (date_s, time_s) = (parts[1], parts[2]);
    if date_s.len() != 8 || time_s.len() != 6 {
        return None;
    }

    if let Some(token) = parts.get(3).map(|s| s.trim()) {
        if token.len() >= 13 && token.bytes().all(|b| b.is_ascii_digit()) {
            let parsed = token
                .parse::<i64>()
                .ok()
                .and_then(|ms| Local.timestamp_millis_opt(ms).single());
            if let Some(ts) = parsed {
                return Some((ts.naive_local(), StartSource::EpochMillis));
            }
        }
    }

    NaiveDateTime::parse_from_str(&format!("{}{}", date_s, time_s), "%Y%m%d%H%M%S")
        .ok()
        .map(|ts| (ts, StartSource::StemSeconds))
}

/// Match `regex` against the full path and build a timestamp from its named
/// groups. `year`, `month` and `day` are required; time fields default to 0.
pub fn parse_time_from_path(path: &Path, regex: &Regex) -> Option<NaiveDateTime> {
    let text = path.to_string_lossy().replace('\\', "/");
    let caps = regex.captures(&text)?;
    let field = |name: &str| -> Option<u32> {
        caps.name(name).and_then(|m| m.as_str().parse().ok())
    };
    let year = caps.name("year").and_then(|m| m.as_str().parse::<i32>().ok())?;
    let date = NaiveDate::from_ymd_opt(year, field("month")?, field("day")?)?;
    date.and_hms_opt(
        field("hour").unwrap_or(0),
        field("minute").unwrap_or(0),
        field("second").unwrap_or(0),
    )
}

/// Start time from the file name, falling back to the facility's path regex
pub fn start_from_name(path: &Path, path_time: Option<&Regex>) -> Option<(NaiveDateTime, StartSource)> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    parse_start_from_stem(stem).or_else(|| {
        path_time
            .and_then(|re| parse_time_from_path(path, re))
            .map(|ts| (ts, StartSource::PathRegex))
    })
}

/// Outcome of trying a path-time regex against a sample path
#[derive(Debug, Clone, Serialize)]
pub struct RegexTestResult {
    pub matched: bool,
    pub groups: BTreeMap<String, String>,
    pub timestamp: Option<NaiveDateTime>,
    pub reason: Option<String>,
}

/// Evaluate a path-time regex against one sample path
pub fn test_path_regex(pattern: &str, sample: &str) -> Result<RegexTestResult, ImportError> {
    let re = Regex::new(pattern)
        .map_err(|source| ImportError::InvalidRegex { field: "path_time_regex", source })?;
    let sample = sample.replace('\\', "/");

    let Some(caps) = re.captures(&sample) else {
        return Ok(RegexTestResult {
            matched: false,
            groups: BTreeMap::new(),
            timestamp: None,
            reason: Some("pattern does not match path".to_string()),
        });
    };

    let groups: BTreeMap<String, String> = re
        .capture_names()
        .flatten()
        .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
        .collect();
    let timestamp = parse_time_from_path(Path::new(&sample), &re);
    let reason = match timestamp {
        Some(_) => None,
        None if ["year", "month", "day"].iter().any(|g| !groups.contains_key(*g)) => {
            Some("named groups year, month and day are required".to_string())
        }
        None => Some("captured fields do not form a valid date/time".to_string()),
    };

    Ok(RegexTestResult { matched: true, groups, timestamp, reason })
}

/// Result of locating one camera's recordings
#[derive(Debug, Clone, Default)]
pub struct LocateOutcome {
    pub segments: Vec<RawSegment>,
    pub files_seen: usize,
    pub dropped: Vec<PathBuf>,
    pub root_missing: bool,
    pub cancelled: bool,
}

/// Discovers a camera's files and their time spans
pub struct SegmentLocator<'a, P> {
    facility: &'a Facility,
    probe: &'a P,
}

impl<'a, P: MediaProbe> SegmentLocator<'a, P> {
    pub fn new(facility: &'a Facility, probe: &'a P) -> Self {
        Self { facility, probe }
    }

    /// Find all recordings of `camera` whose assumed span touches `range`.
    ///
    /// `cancel` is polled between files; a cancelled outcome carries whatever
    /// was found so far.
    pub async fn locate(
        &self,
        camera: u32,
        range: Option<(NaiveDateTime, NaiveDateTime)>,
        cancel: &CancelFlag,
    ) -> Result<LocateOutcome> {
        let root = self.facility.camera_root(camera);
        let mut outcome = LocateOutcome::default();

        if !root.is_dir() {
            warn!("Camera {} folder not found: {}", camera, root.display());
            outcome.root_missing = true;
            return Ok(outcome);
        }

        info!("Camera {}: scanning {}", camera, root.display());
        let filter = MediaFilter::new(self.facility.ignore_dir.clone(), self.facility.extensions.clone());
        let (files, summary) = list_files(root, filter, cancel.clone()).await?;
        outcome.files_seen = summary.accepted;
        if summary.stopped {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let assumed = Duration::seconds(self.facility.max_file_duration_secs.min(MAX_FILE_DURATION_LIMIT_SECS) as i64);
        for path in files {
            if cancel.is_set() {
                outcome.cancelled = true;
                break;
            }

            let named = start_from_name(&path, self.facility.path_time.as_ref());
            let modified = match &named {
                Some(_) => None,
                None => modified_time(&path),
            };

            // Cheap relevance check with the assumed duration before probing
            let (rough_start, rough_end) = match (&named, modified) {
                (Some((start, _)), _) => (*start, *start + assumed),
                (None, Some(mtime)) => (mtime - assumed, mtime),
                (None, None) => {
                    warn!("Dropping {}: no usable timestamp", path.display());
                    outcome.dropped.push(path);
                    continue;
                }
            };
            if let Some((from, to)) = range {
                if rough_end <= from || rough_start >= to {
                    continue;
                }
            }

            let duration = self.duration_of(&path, assumed).await;
            let (start, end, source) = match (named, modified) {
                (Some((start, source)), _) => (start, start + duration, source),
                (None, Some(mtime)) => (mtime - duration, mtime, StartSource::ModifiedTime),
                (None, None) => continue,
            };
            if end <= start {
                warn!("Dropping {}: empty time span", path.display());
                outcome.dropped.push(path);
                continue;
            }

            debug!("Camera {}: {} {} -> {} ({:?})", camera, path.display(), start, end, source);
            outcome.segments.push(RawSegment { path, camera_id: camera, start, end });
        }

        info!(
            "Camera {}: {} segments from {} files ({} dropped)",
            camera,
            outcome.segments.len(),
            outcome.files_seen,
            outcome.dropped.len()
        );
        Ok(outcome)
    }

    async fn duration_of(&self, path: &Path, assumed: Duration) -> Duration {
        if !self.facility.probe_segments {
            return assumed;
        }
        let result = self.probe.probe(path).await;
        match result.usable_duration() {
            Some(secs) => Duration::milliseconds((secs * 1000.0).round() as i64),
            None => {
                debug!(
                    "Probe gave no duration for {} ({}), assuming {}s",
                    path.display(),
                    result.error.as_deref().unwrap_or("unknown"),
                    assumed.num_seconds()
                );
                assumed
            }
        }
    }
}

/// Walk a camera folder off the async runtime
async fn list_files(
    root: PathBuf,
    filter: MediaFilter,
    cancel: CancelFlag,
) -> Result<(Vec<PathBuf>, WalkSummary)> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let summary = walk_files(&root, &filter, |path| {
            if cancel.is_set() {
                return ControlFlow::Break(());
            }
            files.push(path);
            ControlFlow::Continue(())
        });
        (files, summary)
    })
    .await
    .context("Directory walk task failed")
}

fn modified_time(path: &Path) -> Option<NaiveDateTime> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Local>::from(modified).naive_local())
}
