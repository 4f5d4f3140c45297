use std::sync::Arc;
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use crate::config::ImporterConfig;
use crate::encoder::{check_health, EncodeStatus, Encoder};
use crate::job::{JobStatus, JobUpdate};
use crate::plan::{DayPlan, DayStatus, ImportPlan};
use crate::probe::{FfProbe, MediaProbe};
use crate::queue::{runner, JobContext, Runner};
use crate::sidecar;

/// What an encode job persists to be resumable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodePayload {
    pub plan: ImportPlan,
}

pub fn encode_runner(cfg: Arc<ImporterConfig>, plan: ImportPlan) -> Runner {
    runner(move |ctx| async move {
        let encoder = Encoder::from_config(&cfg);
        let probe = FfProbe::from_config(&cfg);
        run_encode(&ctx, plan, &encoder, &probe).await?;
        Ok(())
    })
}

/// Encode every pending day of `plan`, one at a time.
///
/// Per-day failures are recorded on the day and never fail the job. A
/// cancellation marks the current and all remaining days CANCELLED.
pub async fn run_encode<P: MediaProbe>(
    ctx: &JobContext,
    mut plan: ImportPlan,
    encoder: &Encoder,
    probe: &P,
) -> Result<ImportPlan> {
    let job_id = ctx.job_id().to_string();
    let total = plan.days().filter(|d| d.status != DayStatus::Missing).count() as u64;
    let tolerance = plan.health_tolerance_secs;
    let mut done = 0u64;
    ctx.set_progress(0, total);

    // A resumed job starts over from its original plan
    for day in plan.cameras.iter_mut().flat_map(|c| c.days.iter_mut()) {
        if day.status != DayStatus::Missing {
            day.status = DayStatus::Pending;
        }
    }

    let positions: Vec<(usize, usize)> = plan
        .cameras
        .iter()
        .enumerate()
        .flat_map(|(ci, cam)| (0..cam.days.len()).map(move |di| (ci, di)))
        .collect();

    let mut stopped = false;
    for (ci, di) in positions {
        let day = &mut plan.cameras[ci].days[di];

        if day.status == DayStatus::Missing {
            explain(day);
            continue;
        }
        if stopped || ctx.cancelled() {
            stopped = true;
            day.status = DayStatus::Cancelled;
            continue;
        }

        day.status = DayStatus::Running;
        let message = format!("Encoding camera {} day {}", day.camera_id, day.day_index);
        ctx.update(
            JobUpdate::new()
                .message(message)
                .meta("plan", json!(plan.summary())),
        );

        let day = &mut plan.cameras[ci].days[di];
        encode_day(ctx, &job_id, day, encoder, probe, tolerance).await;
        if day.status == DayStatus::Cancelled {
            stopped = true;
        } else {
            done += 1;
        }

        ctx.update(
            JobUpdate::new()
                .progress(done, total)
                .meta("plan", json!(plan.summary())),
        );
    }

    let counts = plan.counts();
    if stopped {
        info!("Job {}: encode cancelled after {} days", job_id, done);
        ctx.update(
            JobUpdate::new()
                .status(JobStatus::Cancelled)
                .message(format!("Cancelled after {} of {} days", done, total))
                .meta("plan", json!(plan.summary()))
                .meta("counts", json!(counts)),
        );
    } else {
        let message = format!(
            "Encoded {} days ({} failed, {} missing)",
            counts.done, counts.failed, counts.missing
        );
        info!("Job {}: ✅ {}", job_id, message);
        ctx.update(
            JobUpdate::new()
                .message(message)
                .meta("plan", json!(plan.summary()))
                .meta("counts", json!(counts)),
        );
    }
    Ok(plan)
}

async fn encode_day<P: MediaProbe>(
    ctx: &JobContext,
    job_id: &str,
    day: &mut DayPlan,
    encoder: &Encoder,
    probe: &P,
    tolerance: f64,
) {
    let (Some(list), Some(output)) = (day.list_path.clone(), day.output_path.clone()) else {
        fail(day, "list not found".to_string());
        return;
    };
    if !list.is_file() {
        fail(day, format!("list not found: {}", list.display()));
        return;
    }

    info!("Job {}: encoding camera {} day {} -> {}", job_id, day.camera_id, day.day_index, output.display());
    let outcome = match encoder.run(&list, &output, ctx.cancel_flag()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            fail(day, format!("{:#}", e));
            return;
        }
    };

    day.status = outcome.status.into();
    match outcome.status {
        EncodeStatus::Done => {
            let health = check_health(probe, &output, day.window.duration_secs(), tolerance).await;
            if !health.ok {
                warn!(
                    "Job {}: camera {} day {} output unhealthy: {}",
                    job_id, day.camera_id, day.day_index, health
                );
            }
            day.duration = health.actual;
            day.output_bytes = std::fs::metadata(&output).map(|m| m.len()).ok();
            day.health = Some(health);
            day.message = None;
            if let Err(e) = sidecar::clear_why_txt(&output) {
                warn!("Job {}: {:#}", job_id, e);
            }
        }
        EncodeStatus::Failed => {
            let text = if outcome.diagnostics.trim().is_empty() {
                format!("encoder exited with code {}", outcome.exit_code.unwrap_or(-1))
            } else {
                outcome.diagnostics
            };
            fail(day, text);
        }
        EncodeStatus::Cancelled => {
            day.message = Some("Cancelled".to_string());
        }
    }
}

fn fail(day: &mut DayPlan, message: String) {
    warn!("Camera {} day {} failed: {}", day.camera_id, day.day_index, message);
    day.status = DayStatus::Failed;
    day.message = Some(message);
    explain(day);
}

fn explain(day: &DayPlan) {
    let (Some(output), Some(reason)) = (&day.output_path, sidecar::explain_day(day)) else {
        return;
    };
    if let Err(e) = sidecar::write_why_txt(output, &reason) {
        warn!("{:#}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::locator::tests::FakeProbe;
    use crate::manifest;
    use crate::plan::{CameraPlan, TrimmedItem};
    use crate::queue::tests::wait_terminal;
    use crate::queue::TaskQueue;
    use crate::window::day_windows;
    use std::path::Path;
    use std::time::Duration;

    fn fixture(root: &Path) -> ImportPlan {
        let windows = day_windows("2024-03-01", "2024-03-03", "08:00", "09:00").unwrap();
        let mut plan = ImportPlan {
            facility: "lab".into(),
            experiment: "CAGE".into(),
            treatment: "ctrl".into(),
            batch: 1,
            output_dir: root.to_path_buf(),
            output_extension: ".mp4".into(),
            windows: windows.clone(),
            health_tolerance_secs: 300.0,
            cameras: vec![],
        };
        let days = windows
            .iter()
            .map(|w| {
                let missing = w.index == 2;
                let list_path = plan.list_path(1, w.index);
                if !missing {
                    let items = vec![TrimmedItem { path: root.join("src.mp4"), inpoint: 0.0, outpoint: None }];
                    manifest::write(&list_path, &items).unwrap();
                }
                DayPlan {
                    camera_id: 1,
                    day_index: w.index,
                    window: w.clone(),
                    status: if missing { DayStatus::Missing } else { DayStatus::Pending },
                    items: vec![],
                    segments: if missing { 0 } else { 1 },
                    list_path: (!missing).then_some(list_path),
                    output_path: Some(plan.output_path(1, w.index)),
                    message: None,
                    duration: None,
                    output_bytes: None,
                    health: None,
                }
            })
            .collect();
        plan.cameras.push(CameraPlan { camera_id: 1, warning: None, days });
        plan
    }

    fn sh_encoder(script: &str) -> Encoder {
        let mut enc = Encoder::new(
            "sh",
            vec!["-c".into(), script.into(), "sh".into(), "{list}".into(), "{output}".into()],
            Duration::from_millis(200),
        );
        enc.poll = Duration::from_millis(20);
        enc
    }

    async fn run(plan: ImportPlan, encoder: Encoder, probe: FakeProbe, cancel_first: bool) -> (crate::job::Job, ImportPlan) {
        let queue = TaskQueue::ephemeral();
        let result = Arc::new(std::sync::Mutex::new(None));
        let slot = result.clone();
        let id = queue.enqueue("import.encode", "encode", None, runner(move |ctx| async move {
            if cancel_first {
                ctx.queue().cancel(ctx.job_id());
            }
            let plan = run_encode(&ctx, plan, &encoder, &probe).await?;
            *slot.lock().unwrap() = Some(plan);
            Ok(())
        }));
        queue.start();
        let job = wait_terminal(&queue, &id).await;
        let plan = result.lock().unwrap().take().unwrap();
        (job, plan)
    }

    #[tokio::test]
    async fn test_unhealthy_output_still_done() {
        let dir = tempfile::tempdir().unwrap();
        let plan = fixture(dir.path());
        let out1 = plan.output_path(1, 1);
        let out3 = plan.output_path(1, 3);

        let mut probe = FakeProbe::default();
        probe.durations.insert(out1.clone(), 3590.0);
        // Day 3 produced only 10 minutes of a 1h window
        probe.durations.insert(out3.clone(), 600.0);

        let (job, plan) = run(plan, sh_encoder(r#"cp "$1" "$2""#), probe, false).await;
        assert_eq!(job.status, JobStatus::Done);

        let days = &plan.cameras[0].days;
        assert_eq!(days[0].status, DayStatus::Done);
        assert!(days[0].health.as_ref().unwrap().ok);
        assert_eq!(days[0].duration, Some(3590.0));
        assert!(days[0].output_bytes.unwrap() > 0);

        assert_eq!(days[1].status, DayStatus::Missing);
        assert!(sidecar::why_txt_path(&plan.output_path(1, 2)).exists());

        assert_eq!(days[2].status, DayStatus::Done);
        let health = days[2].health.as_ref().unwrap();
        assert!(!health.ok);
        assert_eq!(health.delta, Some(3000.0));
        assert_eq!((job.progress, job.total), (2, 2));
    }

    #[tokio::test]
    async fn test_day_failure_does_not_fail_job() {
        let dir = tempfile::tempdir().unwrap();
        let plan = fixture(dir.path());
        // Day 3 lost its manifest
        std::fs::remove_file(plan.list_path(1, 3)).unwrap();

        let (job, plan) = run(
            plan,
            sh_encoder(r#"echo "Invalid data found when processing input" >&2; exit 1"#),
            FakeProbe::default(),
            false,
        )
        .await;
        assert_eq!(job.status, JobStatus::Done);
        let days = &plan.cameras[0].days;
        assert_eq!(days[0].status, DayStatus::Failed);
        assert!(days[0].message.as_deref().unwrap().contains("Invalid data"));
        assert!(days[2].message.as_deref().unwrap().contains("list not found"));
        let why = std::fs::read_to_string(sidecar::why_txt_path(&plan.output_path(1, 1))).unwrap();
        assert!(why.contains("encoding failed"));
        assert!(job.message.contains("2 failed"));
    }

    #[tokio::test]
    async fn test_cancel_mid_encode() {
        let dir = tempfile::tempdir().unwrap();
        let plan = fixture(dir.path());

        let queue = TaskQueue::ephemeral();
        let encoder = sh_encoder("exec sleep 30");
        let id = queue.enqueue("import.encode", "encode", None, runner(move |ctx| async move {
            run_encode(&ctx, plan, &encoder, &FakeProbe::default()).await?;
            Ok(())
        }));
        queue.start();

        for _ in 0..100 {
            if queue.get(&id).map(|j| j.status == JobStatus::Running).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        queue.cancel(&id);

        let job = wait_terminal(&queue, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        let plan: ImportPlan = serde_json::from_value(job.meta["plan"].clone()).unwrap();
        let days = &plan.cameras[0].days;
        assert_eq!(days[0].status, DayStatus::Cancelled);
        assert_eq!(days[1].status, DayStatus::Missing);
        assert_eq!(days[2].status, DayStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_day() {
        let dir = tempfile::tempdir().unwrap();
        let plan = fixture(dir.path());
        let (job, plan) = run(plan, sh_encoder("exit 0"), FakeProbe::default(), true).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(plan.cameras[0]
            .days
            .iter()
            .all(|d| matches!(d.status, DayStatus::Cancelled | DayStatus::Missing)));
    }
}
