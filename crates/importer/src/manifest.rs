use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, bail, Context, Result};
use crate::plan::TrimmedItem;

/// Seconds as `HH:MM:SS.mmm`
pub fn format_timestamp(secs: f64) -> String {
    let total_ms = (secs.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        ms
    )
}

/// Inverse of [`format_timestamp`]; also accepts plain seconds
pub fn parse_timestamp(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split(':').collect();
    let secs = match parts.as_slice() {
        [s] => s.parse::<f64>()?,
        [m, s] => m.parse::<f64>()? * 60.0 + s.parse::<f64>()?,
        [h, m, s] => h.parse::<f64>()? * 3600.0 + m.parse::<f64>()? * 60.0 + s.parse::<f64>()?,
        _ => bail!("bad timestamp: {}", raw),
    };
    if !secs.is_finite() || secs < 0.0 {
        bail!("bad timestamp: {}", raw);
    }
    Ok(secs)
}

/// Single-quote a path for the concat demuxer: `'` becomes `'\''`.
/// Everything else, backslashes included, is literal inside the quotes.
/// Non-UTF-8 paths cannot be written to a list and are rejected.
pub fn quote_path(path: &Path) -> Result<String> {
    let text = path
        .to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))?;
    Ok(format!("'{}'", text.replace('\'', "'\\''")))
}

fn unquote_path(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .ok_or_else(|| anyhow!("unquoted file entry: {}", raw))?;
    Ok(PathBuf::from(inner.replace("'\\''", "'")))
}

/// Render items in concat-list grammar
pub fn render(items: &[TrimmedItem]) -> Result<String> {
    let mut out = String::new();
    for item in items {
        out.push_str(&format!("file {}\n", quote_path(&item.path)?));
        out.push_str(&format!("inpoint {}\n", format_timestamp(item.inpoint)));
        if let Some(outpoint) = item.outpoint {
            out.push_str(&format!("outpoint {}\n", format_timestamp(outpoint)));
        }
    }
    Ok(out)
}

/// Parse a concat list back into items; directives other than
/// `file`/`inpoint`/`outpoint` are ignored
pub fn parse(text: &str) -> Result<Vec<TrimmedItem>> {
    let mut items: Vec<TrimmedItem> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (directive, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match directive {
            "file" => items.push(TrimmedItem {
                path: unquote_path(rest).with_context(|| format!("line {}", lineno + 1))?,
                inpoint: 0.0,
                outpoint: None,
            }),
            "inpoint" | "outpoint" => {
                let item = items
                    .last_mut()
                    .ok_or_else(|| anyhow!("line {}: {} before any file", lineno + 1, directive))?;
                let value = parse_timestamp(rest).with_context(|| format!("line {}", lineno + 1))?;
                if directive == "inpoint" {
                    item.inpoint = value;
                } else {
                    item.outpoint = Some(value);
                }
            }
            _ => {}
        }
    }
    Ok(items)
}

/// Write the manifest, creating parent directories
pub fn write(path: &Path, items: &[TrimmedItem]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create manifest dir: {}", parent.display()))?;
    }
    fs::write(path, render(items)?)
        .with_context(|| format!("Failed to write manifest: {}", path.display()))
}

pub fn read(path: &Path) -> Result<Vec<TrimmedItem>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    parse(&text).with_context(|| format!("Bad manifest: {}", path.display()))
}
