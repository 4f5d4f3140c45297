pub mod config;
pub mod error;
pub mod window;
pub mod walk;
pub mod probe;
pub mod locator;
pub mod plan;
pub mod reconcile;
pub mod manifest;
pub mod encoder;
pub mod sidecar;
pub mod job;
pub mod queue;
pub mod import;
pub mod scan;
pub mod encode;
pub mod commands;

pub use config::{Facility, FacilityConfig, ImporterConfig};
pub use error::ImportError;
pub use job::{Job, JobStatus, JobUpdate};
pub use plan::{DayPlan, DayStatus, ImportPlan};
pub use queue::{JobContext, TaskQueue};
pub use import::{ImportRequest, JobReport};
pub use commands::{CommandAction, CommandFile};
