use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use crate::config::ImporterConfig;
use crate::job::CancelFlag;
use crate::plan::{DayStatus, Health};
use crate::probe::MediaProbe;

/// How often the supervision loop checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Keep this many trailing output lines as diagnostics
const DIAGNOSTIC_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncodeStatus {
    Done,
    Failed,
    Cancelled,
}

impl From<EncodeStatus> for DayStatus {
    fn from(status: EncodeStatus) -> Self {
        match status {
            EncodeStatus::Done => DayStatus::Done,
            EncodeStatus::Failed => DayStatus::Failed,
            EncodeStatus::Cancelled => DayStatus::Cancelled,
        }
    }
}

/// Result of one supervised encoder run
#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub status: EncodeStatus,
    pub exit_code: Option<i32>,
    /// Tail of the encoder's stderr (stdout when stderr is empty)
    pub diagnostics: String,
}

/// Runs the external concat encoder under cancellation supervision
#[derive(Debug, Clone)]
pub struct Encoder {
    pub program: PathBuf,
    /// Argument template with `{list}` and `{output}` placeholders
    pub args: Vec<String>,
    /// Time between the quit request and a forced kill
    pub grace: Duration,
    pub poll: Duration,
}

impl Encoder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, grace: Duration) -> Self {
        Self { program: program.into(), args, grace, poll: POLL_INTERVAL }
    }

    pub fn from_config(cfg: &ImporterConfig) -> Self {
        Self::new(
            cfg.encoder_bin.clone(),
            cfg.encoder_args.clone(),
            Duration::from_secs(cfg.cancel_grace_secs),
        )
    }

    pub fn build_args(&self, list: &Path, output: &Path) -> Vec<String> {
        let list = list.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{list}", &list).replace("{output}", &output))
            .collect()
    }

    /// Encode `list` into `output`.
    ///
    /// Returns `Err` only when the encoder could not be started. A non-zero
    /// exit is `Failed`; a set `cancel` flag always yields `Cancelled`.
    pub async fn run(&self, list: &Path, output: &Path, cancel: &CancelFlag) -> Result<EncodeOutcome> {
        let args = self.build_args(list, output);
        let cmd_str = format!("{} {}", self.program.display(), args.join(" "));
        debug!("Executing encoder: {}", cmd_str);

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| format!(
            "Failed to spawn encoder at: {}. Ensure it is installed and accessible.",
            self.program.display()
        ))?;

        let stdout = child.stdout.take()
            .ok_or_else(|| anyhow!("Failed to capture encoder stdout"))?;
        let stderr = child.stderr.take()
            .ok_or_else(|| anyhow!("Failed to capture encoder stderr"))?;
        let stdout_handle = collect_lines(stdout);
        let stderr_handle = collect_lines(stderr);

        let mut ticker = tokio::time::interval(self.poll);
        let exited = loop {
            tokio::select! {
                res = child.wait() => {
                    break Some(res.context("Failed to wait for encoder process")?);
                }
                _ = ticker.tick() => {
                    if cancel.is_set() {
                        break None;
                    }
                }
            }
        };

        let status = match exited {
            Some(status) => status,
            None => {
                info!("Encoder cancelled, stopping {}", output.display());
                self.stop(&mut child).await?
            }
        };

        let stdout = join_lines(stdout_handle).await;
        let stderr = join_lines(stderr_handle).await;
        let diagnostics = if stderr.trim().is_empty() { stdout } else { stderr };

        let outcome_status = if cancel.is_set() {
            EncodeStatus::Cancelled
        } else if status.success() {
            EncodeStatus::Done
        } else {
            EncodeStatus::Failed
        };
        if outcome_status == EncodeStatus::Failed {
            warn!(
                "Encoder failed (exit code: {})\nCommand: {}\nSTDERR:\n{}",
                status.code().unwrap_or(-1),
                cmd_str,
                diagnostics
            );
        }

        Ok(EncodeOutcome {
            status: outcome_status,
            exit_code: status.code(),
            diagnostics,
        })
    }

    /// Ask the encoder to quit, then kill it after the grace window
    async fn stop(&self, child: &mut Child) -> Result<std::process::ExitStatus> {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q\n").await {
                debug!("Encoder stdin closed before quit request: {}", e);
            }
            drop(stdin);
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(res) => res.context("Failed to wait for encoder process"),
            Err(_) => {
                warn!("Encoder ignored quit request for {}s, killing", self.grace.as_secs_f64());
                child.kill().await.context("Failed to kill encoder process")?;
                child.wait().await.context("Failed to reap encoder process")
            }
        }
    }
}

fn collect_lines<R>(reader: R) -> JoinHandle<Vec<String>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut line_stream = BufReader::new(reader).lines();
        while let Ok(Some(line)) = line_stream.next_line().await {
            lines.push(line);
            if lines.len() > DIAGNOSTIC_LINES * 4 {
                lines.drain(..lines.len() - DIAGNOSTIC_LINES);
            }
        }
        lines
    })
}

/// Tail of a reader task. A grandchild still holding the pipe must not block us.
async fn join_lines(handle: JoinHandle<Vec<String>>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(Duration::from_secs(2), handle).await {
        Ok(Ok(lines)) => {
            let skip = lines.len().saturating_sub(DIAGNOSTIC_LINES);
            lines[skip..].join("\n")
        }
        Ok(Err(e)) => format!("<output unavailable: {}>", e),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

/// Compare the produced file's duration with the expected window length
pub async fn check_health<P: MediaProbe>(probe: &P, output: &Path, expected: f64, tolerance: f64) -> Health {
    let result = probe.probe(output).await;
    if let Some(err) = &result.error {
        warn!("Health probe failed for {}: {}", output.display(), err);
    }
    Health::evaluate(expected, result.usable_duration(), tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_encoder(script: &str, grace_ms: u64) -> Encoder {
        let mut enc = Encoder::new(
            "sh",
            vec!["-c".into(), script.into(), "sh".into(), "{list}".into(), "{output}".into()],
            Duration::from_millis(grace_ms),
        );
        enc.poll = Duration::from_millis(20);
        enc
    }

    #[test]
    fn test_build_args_substitutes_placeholders() {
        let enc = Encoder::new("ffmpeg", crate::config::default_encoder_args(), Duration::from_secs(3));
        let args = enc.build_args(Path::new("/w/a.txt"), Path::new("/w/a.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/w/a.txt"));
        assert_eq!(args.last().map(String::as_str), Some("/w/a.mp4"));
        assert!(!args.iter().any(|a| a.contains('{')));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        std::fs::write(&list, "file 'a.mp4'\n").unwrap();
        let out = dir.path().join("out/day.mp4");

        let enc = sh_encoder(r#"cat "$1" > "$2""#, 500);
        let outcome = enc.run(&list, &out, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome.status, EncodeStatus::Done);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "file 'a.mp4'\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_keeps_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let enc = sh_encoder(r#"echo "Impossible to open '$1'" >&2; exit 3"#, 500);
        let outcome = enc
            .run(&dir.path().join("l.txt"), &dir.path().join("o.mp4"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, EncodeStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.diagnostics.contains("Impossible to open"));
    }

    #[tokio::test]
    async fn test_missing_encoder_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let enc = Encoder::new("/nonexistent/encoder", vec![], Duration::from_secs(1));
        let result = enc
            .run(&dir.path().join("l.txt"), &dir.path().join("o.mp4"), &CancelFlag::new())
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_stubborn_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.mp4");
        let pid_file = dir.path().join("o.mp4.pid");
        let enc = sh_encoder(r#"echo $$ > "$2.pid"; exec sleep 30"#, 200);

        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.set();
        });

        let started = Instant::now();
        let outcome = enc.run(&dir.path().join("l.txt"), &out, &cancel).await.unwrap();
        assert_eq!(outcome.status, EncodeStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));

        // The child was reaped: its pid no longer exists
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let alive = std::process::Command::new("kill")
            .args(["-0", pid.trim()])
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!alive.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_with_graceful_quit_is_still_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let enc = sh_encoder(r#"read cmd; echo "got $cmd" >&2; exit 0"#, 5000);

        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.set();
        });

        let started = Instant::now();
        let outcome = enc
            .run(&dir.path().join("l.txt"), &dir.path().join("o.mp4"), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, EncodeStatus::Cancelled);
        assert!(outcome.diagnostics.contains("got q"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_health_flags_short_output() {
        use crate::locator::tests::FakeProbe;
        let mut probe = FakeProbe::default();
        let out = PathBuf::from("/out/day.mp4");
        probe.durations.insert(out.clone(), 3000.0);

        let health = check_health(&probe, &out, 3600.0, 300.0).await;
        assert!(!health.ok);
        assert_eq!(health.delta, Some(600.0));

        let health = check_health(&probe, &out, 3200.0, 300.0).await;
        assert!(health.ok);

        let missing = check_health(&probe, Path::new("/out/none.mp4"), 3600.0, 300.0).await;
        assert!(!missing.ok);
        assert!(missing.actual.is_none());
    }
}
