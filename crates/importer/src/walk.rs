use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use regex::Regex;
use walkdir::WalkDir;

/// Decides which parts of a tree a walk visits.
pub trait WalkFilter {
    /// Return false to prune a directory and everything below it
    fn descend(&self, dir_name: &str) -> bool;
    /// Return true for files the walk should hand to the visitor
    fn accept(&self, path: &Path) -> bool;
}

/// Recording files: allowed extensions, ignored directories pruned by regex.
#[derive(Debug, Clone)]
pub struct MediaFilter {
    ignore_dir: Option<Regex>,
    extensions: Vec<String>,
}

impl MediaFilter {
    /// `extensions` are expected lowercase with a leading dot
    pub fn new(ignore_dir: Option<Regex>, extensions: Vec<String>) -> Self {
        Self { ignore_dir, extensions }
    }
}

impl WalkFilter for MediaFilter {
    fn descend(&self, dir_name: &str) -> bool {
        match &self.ignore_dir {
            Some(re) => !re.is_match(dir_name),
            None => true,
        }
    }

    fn accept(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| format!(".{}", s.to_lowercase()));
        match ext {
            Some(ext) => self.extensions.contains(&ext),
            None => false,
        }
    }
}

/// Counters reported after a walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub entries: usize,
    pub accepted: usize,
    /// The visitor asked the walk to stop early
    pub stopped: bool,
}

/// Walk `root` in file-name order, calling `visit` for every accepted file.
///
/// Unreadable entries are logged and skipped. `visit` returning
/// `ControlFlow::Break` ends the walk.
pub fn walk_files<F, V>(root: &Path, filter: &F, mut visit: V) -> WalkSummary
where
    F: WalkFilter,
    V: FnMut(PathBuf) -> ControlFlow<()>,
{
    let mut summary = WalkSummary::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            let keep = filter.descend(&name);
            if !keep {
                debug!("Ignoring directory: {}", e.path().display());
            }
            keep
        });

    for entry in walker {
        summary.entries += 1;
        if summary.entries % 1000 == 0 {
            info!("Scanned {} entries so far in {}...", summary.entries, root.display());
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !filter.accept(entry.path()) {
            continue;
        }

        summary.accepted += 1;
        if visit(entry.into_path()).is_break() {
            summary.stopped = true;
            break;
        }
    }

    summary
}
