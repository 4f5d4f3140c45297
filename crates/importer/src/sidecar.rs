use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use std::fs;
use crate::plan::{DayPlan, DayStatus};

/// Get the path to the why.txt file for a planned output
pub fn why_txt_path(output_path: &Path) -> PathBuf {
    let mut path = output_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file explaining why a day has no output
pub fn write_why_txt(output_path: &Path, reason: &str) -> Result<()> {
    let why_path = why_txt_path(output_path);
    if let Some(parent) = why_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create dir for why.txt: {}", parent.display()))?;
    }
    fs::write(&why_path, reason)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}

/// Remove a stale why.txt once the day has been produced
pub fn clear_why_txt(output_path: &Path) -> Result<()> {
    let why_path = why_txt_path(output_path);
    if why_path.exists() {
        fs::remove_file(&why_path)
            .with_context(|| format!("Failed to remove why.txt: {}", why_path.display()))?;
    }
    Ok(())
}

/// Human-readable explanation for a day without output
pub fn explain_day(day: &DayPlan) -> Option<String> {
    let header = format!(
        "camera {} day {} ({} -> {})",
        day.camera_id, day.day_index, day.window.start, day.window.end
    );
    match day.status {
        DayStatus::Missing => Some(format!("{}: no recordings found in this window\n", header)),
        DayStatus::Failed => Some(format!(
            "{}: encoding failed\n{}\n",
            header,
            day.message.as_deref().unwrap_or("no diagnostics")
        )),
        _ => None,
    }
}
