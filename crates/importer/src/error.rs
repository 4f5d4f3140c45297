use std::path::PathBuf;
use thiserror::Error;

/// Request-level rejections. Every variant is raised synchronously, before a
/// job is created.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unknown facility: {0}")]
    UnknownFacility(String),

    #[error("invalid date/time range: {0}")]
    InvalidRange(String),

    #[error("no cameras selected")]
    NoCameras,

    #[error("cameras {requested:?} not allowed for facility (allowed: {allowed:?})")]
    CamerasNotAllowed { requested: Vec<u32>, allowed: Vec<u32> },

    #[error("source folder not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("invalid {field} regex: {source}")]
    InvalidRegex {
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("invalid duration setting: {0}")]
    InvalidDuration(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
