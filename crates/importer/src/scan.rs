use std::sync::Arc;
use anyhow::Result;
use log::{info, warn};
use serde_json::json;
use crate::config::ImporterConfig;
use crate::import::{submit_encode, PreparedImport};
use crate::job::{JobStatus, JobUpdate};
use crate::locator::SegmentLocator;
use crate::manifest;
use crate::plan::{CameraPlan, DayStatus, ImportPlan};
use crate::probe::{FfProbe, MediaProbe};
use crate::queue::{runner, JobContext, Runner};
use crate::reconcile::reconcile;

/// Runner for a scan job using the configured ffprobe
pub fn scan_runner(cfg: Arc<ImporterConfig>, prepared: PreparedImport) -> Runner {
    runner(move |ctx| async move {
        let probe = FfProbe::from_config(&cfg);
        let plan = run_scan(&ctx, &cfg, &prepared, &probe).await?;

        if let Some(plan) = plan {
            if prepared.request.auto_encode && plan.counts().pending > 0 {
                let encode_id = submit_encode(ctx.queue(), cfg.clone(), plan, None);
                info!("Job {}: queued encode job {}", ctx.job_id(), encode_id);
                ctx.update(JobUpdate::new().meta("encode_job", json!(encode_id)));
            }
        }
        Ok(())
    })
}

/// Locate, reconcile and write manifests for every requested camera.
///
/// Returns `None` when the job was cancelled part-way; the job is then
/// already marked CANCELLED.
pub async fn run_scan<P: MediaProbe>(
    ctx: &JobContext,
    cfg: &ImporterConfig,
    prepared: &PreparedImport,
    probe: &P,
) -> Result<Option<ImportPlan>> {
    let job_id = ctx.job_id().to_string();
    let total = prepared.cameras.len() as u64;
    ctx.set_progress(0, total);

    let mut plan = prepared.empty_plan(&cfg.output_extension);
    let range = match (prepared.windows.first(), prepared.windows.last()) {
        (Some(first), Some(last)) => Some((first.start, last.end)),
        _ => None,
    };
    let locator = SegmentLocator::new(&prepared.facility, probe);

    for (done, &camera) in prepared.cameras.iter().enumerate() {
        if ctx.cancelled() {
            return Ok(cancelled(ctx, &job_id));
        }
        ctx.update(JobUpdate::new().message(format!("Scanning camera {}", camera)));

        let located = locator.locate(camera, range, ctx.cancel_flag()).await?;
        if located.cancelled {
            return Ok(cancelled(ctx, &job_id));
        }

        let mut days = reconcile(camera, &located.segments, &prepared.windows);
        for day in days.iter_mut() {
            day.output_path = Some(plan.output_path(camera, day.day_index));
            if day.status == DayStatus::Missing {
                continue;
            }
            let list_path = plan.list_path(camera, day.day_index);
            match manifest::write(&list_path, &day.items) {
                Ok(()) => day.list_path = Some(list_path),
                Err(e) => {
                    warn!("Job {}: {:#}", job_id, e);
                    day.status = DayStatus::Failed;
                    day.message = Some(format!("{:#}", e));
                }
            }
        }

        let warning = if located.root_missing {
            Some(format!("camera folder not found: {}", prepared.facility.camera_root(camera).display()))
        } else if !located.dropped.is_empty() {
            Some(format!("{} files without a usable timestamp were skipped", located.dropped.len()))
        } else {
            None
        };

        let pending = days.iter().filter(|d| d.status == DayStatus::Pending).count();
        info!(
            "Job {}: camera {} -> {} segments, {}/{} days with footage",
            job_id,
            camera,
            located.segments.len(),
            pending,
            days.len()
        );
        plan.cameras.push(CameraPlan { camera_id: camera, warning, days });

        ctx.update(
            JobUpdate::new()
                .progress(done as u64 + 1, total)
                .meta("plan", json!(plan.summary())),
        );
    }

    let counts = plan.counts();
    let message = format!(
        "Plan ready: {} days to encode, {} missing",
        counts.pending, counts.missing
    );
    info!("Job {}: ✅ {}", job_id, message);
    ctx.update(
        JobUpdate::new()
            .message(message)
            .meta("plan", json!(plan.summary()))
            .meta("counts", json!(counts)),
    );
    Ok(Some(plan))
}

fn cancelled(ctx: &JobContext, job_id: &str) -> Option<ImportPlan> {
    info!("Job {}: scan cancelled", job_id);
    ctx.update(
        JobUpdate::new()
            .status(JobStatus::Cancelled)
            .message("Cancelled during scan"),
    );
    None
}
