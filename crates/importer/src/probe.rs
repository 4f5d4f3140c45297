use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use crate::config::ImporterConfig;

/// What a media probe could tell about a file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// The probe tool itself could be run
    pub available: bool,
    /// Duration in seconds
    pub duration: Option<f64>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self { available: false, duration: None, error: Some(reason.into()) }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { available: true, duration: None, error: Some(reason.into()) }
    }

    pub fn with_duration(secs: f64) -> Self {
        Self { available: true, duration: Some(secs), error: None }
    }

    /// Duration worth trusting: tool ran, no error, strictly positive
    pub fn usable_duration(&self) -> Option<f64> {
        if !self.available || self.error.is_some() {
            return None;
        }
        self.duration.filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// Something that can report a media file's duration.
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> impl Future<Output = ProbeResult> + Send;
}

/// Complete ffprobe output structure (only the parts we read)
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub duration: Option<String>,
}

impl FFProbeData {
    /// Duration of the first video stream, falling back to the container duration
    pub fn duration_secs(&self) -> Option<f64> {
        let video = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| s.duration.as_deref());
        let format = self.format.as_ref().and_then(|f| f.duration.as_deref());

        [video, format]
            .into_iter()
            .flatten()
            .filter_map(|d| d.trim().parse::<f64>().ok())
            .find(|d| d.is_finite() && *d > 0.0)
    }
}

/// Parse ffprobe's JSON output
pub fn parse_probe_output(json: &str) -> Result<FFProbeData> {
    serde_json::from_str(json).context("Failed to parse ffprobe JSON")
}

/// Runs the ffprobe binary with a hard timeout
#[derive(Debug, Clone)]
pub struct FfProbe {
    pub ffprobe_bin: PathBuf,
    pub timeout: Duration,
}

impl FfProbe {
    pub fn new(ffprobe_bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { ffprobe_bin: ffprobe_bin.into(), timeout }
    }

    pub fn from_config(cfg: &ImporterConfig) -> Self {
        Self::new(cfg.ffprobe_bin.clone(), Duration::from_secs(cfg.probe_timeout_secs.max(1)))
    }

    /// Run ffprobe and parse the JSON output
    pub async fn probe_file(&self, file_path: &Path) -> Result<FFProbeData> {
        if !file_path.is_file() {
            anyhow::bail!("File does not exist: {}", file_path.display());
        }

        debug!("ffprobe: probing {}", file_path.display());

        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Dropping the output future on timeout kills the child
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!(
                "ffprobe timed out after {}s for {}",
                self.timeout.as_secs(),
                file_path.display()
            ))?
            .with_context(|| format!(
                "Failed to execute ffprobe at {} for: {}",
                self.ffprobe_bin.display(),
                file_path.display()
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "ffprobe failed (exit code {}) for {}: {}",
                exit_code,
                file_path.display(),
                stderr.trim()
            );
        }

        let json_str = String::from_utf8(output.stdout)
            .context("ffprobe output is not valid UTF-8")?;
        parse_probe_output(&json_str)
            .with_context(|| format!("Bad ffprobe output for: {}", file_path.display()))
    }
}

impl MediaProbe for FfProbe {
    async fn probe(&self, path: &Path) -> ProbeResult {
        if !path.is_file() {
            return ProbeResult::failed("File not found");
        }
        match self.probe_file(path).await {
            Ok(data) => match data.duration_secs() {
                Some(secs) => ProbeResult::with_duration(secs),
                None => ProbeResult::failed("no duration reported"),
            },
            Err(e) => {
                let missing = e
                    .root_cause()
                    .downcast_ref::<std::io::Error>()
                    .map(|io| io.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false);
                if missing {
                    ProbeResult::unavailable(format!("ffprobe not found: {}", self.ffprobe_bin.display()))
                } else {
                    ProbeResult::failed(format!("{:#}", e))
                }
            }
        }
    }
}
