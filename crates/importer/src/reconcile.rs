use chrono::NaiveDateTime;
use crate::locator::RawSegment;
use crate::plan::{DayPlan, DayStatus, TrimmedItem};
use crate::window::{secs_between, DayWindow};

/// A segment with its end bounded by the next segment's start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedSegment<'a> {
    pub segment: &'a RawSegment,
    pub end: NaiveDateTime,
}

/// Order segments by start (then path) and clip each end to the next start.
///
/// Segments sharing a start time are left unclipped against each other.
pub fn clip_timeline(segments: &[RawSegment]) -> Vec<ClippedSegment<'_>> {
    let mut ordered: Vec<&RawSegment> = segments.iter().collect();
    ordered.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.path.cmp(&b.path)));

    ordered
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let end = match ordered.get(i + 1) {
                Some(next) if next.start > seg.start => seg.end.min(next.start),
                _ => seg.end,
            };
            ClippedSegment { segment: seg, end }
        })
        .collect()
}

/// Build one `DayPlan` per window for a single camera.
///
/// Pure: the same segments and windows always give the same plans, whatever
/// order the segments arrive in. Manifest and output paths are left unset.
pub fn reconcile(camera_id: u32, segments: &[RawSegment], windows: &[DayWindow]) -> Vec<DayPlan> {
    let timeline = clip_timeline(segments);
    windows
        .iter()
        .map(|w| plan_day(camera_id, &timeline, w))
        .collect()
}

fn plan_day(camera_id: u32, timeline: &[ClippedSegment<'_>], window: &DayWindow) -> DayPlan {
    let mut cover = window.start;
    let mut items = Vec::new();

    for clipped in timeline {
        let seg = clipped.segment;
        if !window.overlaps(seg.start, clipped.end) {
            continue;
        }
        let eff_start = seg.start.max(window.start).max(cover);
        let eff_end = clipped.end.min(window.end);
        if eff_start >= eff_end {
            continue;
        }

        // Compared against the discovered (pre-clip) end, not clipped.end, so a
        // neighbor clip always writes an explicit outpoint
        let outpoint = (eff_end < seg.end).then(|| secs_between(seg.start, eff_end));
        items.push(TrimmedItem {
            path: seg.path.clone(),
            inpoint: secs_between(seg.start, eff_start),
            outpoint,
        });
        cover = eff_end;
    }

    let status = if items.is_empty() { DayStatus::Missing } else { DayStatus::Pending };
    DayPlan {
        camera_id,
        day_index: window.index,
        window: window.clone(),
        status,
        segments: items.len(),
        items,
        list_path: None,
        output_path: None,
        message: None,
        duration: None,
        output_bytes: None,
        health: None,
    }
}
