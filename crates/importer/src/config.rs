use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::error::ImportError;

/// Default assumed length of a recording when the probe cannot tell us (4h)
pub const DEFAULT_MAX_FILE_DURATION_SECS: u64 = 4 * 3600;

/// Longest accepted `max_file_duration` (48h)
pub const MAX_FILE_DURATION_LIMIT_SECS: u64 = 48 * 3600;

/// Configuration for the camera import daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Facilities keyed by name (matched case-insensitively)
    pub facilities: BTreeMap<String, FacilityConfig>,
    /// Base directory for manifests and, unless a facility overrides it, encoded output
    pub working_dir: PathBuf,
    /// Directory where the job snapshot and command files live
    pub job_state_dir: PathBuf,
    /// File extensions considered recordings (e.g. ".mp4")
    pub source_extensions: Vec<String>,
    /// Directory-name regex pruned during traversal when the facility sets none
    pub ignore_dir_regex: String,
    /// Allowed |actual - expected| output duration in seconds
    pub health_tolerance_secs: f64,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Upper bound for a single probe invocation
    pub probe_timeout_secs: u64,
    /// Path to the encoder binary
    pub encoder_bin: PathBuf,
    /// Encoder argument template; `{list}` and `{output}` are substituted
    pub encoder_args: Vec<String>,
    /// Seconds between the graceful stop request and a forced kill
    pub cancel_grace_secs: u64,
    /// Extension of encoded day files
    pub output_extension: String,
    /// How often the daemon looks for new command files
    pub command_poll_interval_ms: u64,
    /// Finished jobs kept in the snapshot, oldest dropped first; 0 keeps all
    pub job_retention: usize,
}

/// Per-facility settings as they appear in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FacilityConfig {
    pub source_dir: PathBuf,
    /// Number of cameras; used as 1..=cameras when `camera_list` is empty
    pub cameras: u32,
    pub camera_list: Vec<u32>,
    /// Per-camera subfolder, `{cam}` or `{cam:02d}` is replaced by the camera id
    pub camera_pattern: String,
    pub ignore_dir_regex: Option<String>,
    /// Regex with named groups year/month/day/hour/minute/second, matched against the full path
    pub path_time_regex: String,
    pub max_file_duration: Option<DurationSetting>,
    pub output_dir: Option<PathBuf>,
    pub health_tolerance_secs: Option<f64>,
    /// Probe every discovered file for its real duration
    pub probe_segments: Option<bool>,
}

/// Duration given either as plain seconds or as "H:MM"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSetting {
    Seconds(u64),
    Text(String),
}

impl DurationSetting {
    pub fn to_secs(&self) -> Result<u64, ImportError> {
        let secs = self.parse_secs()?;
        if secs > MAX_FILE_DURATION_LIMIT_SECS {
            return Err(ImportError::InvalidDuration(format!(
                "{} exceeds {}s",
                self, MAX_FILE_DURATION_LIMIT_SECS
            )));
        }
        Ok(secs)
    }

    fn parse_secs(&self) -> Result<u64, ImportError> {
        match self {
            DurationSetting::Seconds(s) => Ok(*s),
            DurationSetting::Text(raw) => {
                let s = raw.trim();
                if s.is_empty() {
                    return Ok(DEFAULT_MAX_FILE_DURATION_SECS);
                }
                let invalid = || ImportError::InvalidDuration(raw.clone());
                if let Some((hh, mm)) = s.split_once(':') {
                    let h: u64 = hh.trim().parse().map_err(|_| invalid())?;
                    let m: u64 = mm.trim().parse().map_err(|_| invalid())?;
                    if m > 59 {
                        return Err(invalid());
                    }
                    h.checked_mul(3600)
                        .and_then(|h| h.checked_add(m * 60))
                        .ok_or_else(invalid)
                } else {
                    s.parse().map_err(|_| invalid())
                }
            }
        }
    }
}

impl std::fmt::Display for DurationSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurationSetting::Seconds(s) => write!(f, "{}", s),
            DurationSetting::Text(raw) => f.write_str(raw),
        }
    }
}

/// A facility after validation: regexes compiled, defaults resolved.
#[derive(Debug, Clone)]
pub struct Facility {
    pub name: String,
    pub source_dir: PathBuf,
    pub camera_list: Vec<u32>,
    pub camera_pattern: String,
    pub ignore_dir: Option<Regex>,
    pub path_time: Option<Regex>,
    pub extensions: Vec<String>,
    pub max_file_duration_secs: u64,
    pub output_dir: PathBuf,
    pub health_tolerance_secs: f64,
    pub probe_segments: bool,
}

impl Facility {
    /// Root folder holding the recordings of one camera
    pub fn camera_root(&self, camera: u32) -> PathBuf {
        self.source_dir.join(format_camera_pattern(&self.camera_pattern, camera))
    }

    pub fn set_camera_pattern(&mut self, pattern: &str) {
        let pattern = pattern.trim();
        if !pattern.is_empty() {
            self.camera_pattern = pattern.to_string();
        }
    }

    pub fn set_path_time_regex(&mut self, pattern: &str) -> Result<(), ImportError> {
        self.path_time = compile_optional("path_time_regex", pattern)?;
        Ok(())
    }
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ImporterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            facilities: BTreeMap::new(),
            working_dir: PathBuf::from("./working"),
            job_state_dir: PathBuf::from("./working/jobs"),
            source_extensions: vec![".mp4".to_string()],
            ignore_dir_regex: String::new(),
            health_tolerance_secs: 300.0,
            ffprobe_bin: PathBuf::from("ffprobe"),
            probe_timeout_secs: 10,
            encoder_bin: PathBuf::from("ffmpeg"),
            encoder_args: default_encoder_args(),
            cancel_grace_secs: 3,
            output_extension: ".mp4".to_string(),
            command_poll_interval_ms: 500,
            job_retention: crate::queue::DEFAULT_RETAINED_JOBS,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.source_extensions = normalize_extensions(&config.source_extensions);
        Ok(config)
    }

    /// File holding the persisted job snapshot
    pub fn state_file(&self) -> PathBuf {
        self.job_state_dir.join("jobs.json")
    }

    /// Directory the daemon drains for submitted commands
    pub fn command_dir(&self) -> PathBuf {
        self.job_state_dir.join("commands")
    }

    /// Names of all configured facilities, lowercased
    pub fn facility_names(&self) -> Vec<String> {
        self.facilities.keys().map(|k| k.trim().to_lowercase()).collect()
    }

    /// Validate one facility into its runtime form
    pub fn facility(&self, name: &str) -> Result<Facility, ImportError> {
        let wanted = name.trim().to_lowercase();
        let (key, fac) = self
            .facilities
            .iter()
            .find(|(k, _)| k.trim().to_lowercase() == wanted)
            .ok_or_else(|| ImportError::UnknownFacility(name.to_string()))?;

        let mut camera_list: Vec<u32> = fac.camera_list.clone();
        camera_list.sort_unstable();
        camera_list.dedup();
        if camera_list.is_empty() && fac.cameras > 0 {
            camera_list = (1..=fac.cameras).collect();
        }

        let ignore_pattern = fac
            .ignore_dir_regex
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(self.ignore_dir_regex.as_str());

        let max_file_duration_secs = match &fac.max_file_duration {
            Some(setting) => setting.to_secs()?,
            None => DEFAULT_MAX_FILE_DURATION_SECS,
        };

        let camera_pattern = if fac.camera_pattern.trim().is_empty() {
            "{cam}".to_string()
        } else {
            fac.camera_pattern.trim().to_string()
        };

        Ok(Facility {
            name: key.trim().to_lowercase(),
            source_dir: expand_home(&fac.source_dir),
            camera_list,
            camera_pattern,
            ignore_dir: compile_optional("ignore_dir_regex", ignore_pattern)?,
            path_time: compile_optional("path_time_regex", &fac.path_time_regex)?,
            extensions: normalize_extensions(&self.source_extensions),
            max_file_duration_secs,
            output_dir: fac
                .output_dir
                .as_deref()
                .filter(|p| !p.as_os_str().is_empty())
                .map(expand_home)
                .unwrap_or_else(|| expand_home(&self.working_dir)),
            health_tolerance_secs: fac
                .health_tolerance_secs
                .unwrap_or(self.health_tolerance_secs)
                .max(0.0),
            probe_segments: fac.probe_segments.unwrap_or(true),
        })
    }
}

/// Stream-copy concat template for ffmpeg
pub fn default_encoder_args() -> Vec<String> {
    [
        "-v", "quiet", "-stats", "-y", "-threads", "4",
        "-f", "concat", "-safe", "0", "-i", "{list}",
        "-vcodec", "copy", "-an", "-copytb", "0", "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Substitute the camera id into a subfolder pattern
pub fn format_camera_pattern(pattern: &str, camera: u32) -> String {
    pattern
        .replace("{cam:02d}", &format!("{:02}", camera))
        .replace("{cam}", &camera.to_string())
}

fn compile_optional(field: &'static str, pattern: &str) -> Result<Option<Regex>, ImportError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| ImportError::InvalidRegex { field, source })
}

fn normalize_extensions(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = raw
        .iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .map(|e| if e.starts_with('.') { e } else { format!(".{}", e) })
        .collect();
    out.dedup();
    if out.is_empty() {
        out.push(".mp4".to_string());
    }
    out
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
