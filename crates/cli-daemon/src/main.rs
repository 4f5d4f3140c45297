use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use importer::{
    commands::{self, CommandAction, CommandFile},
    config::ImporterConfig,
    import::{self, ImportRequest, JobReport},
    job::{load_snapshot, Job},
    locator,
    plan::{batch_dir, next_batch_number},
    queue::TaskQueue,
};
use log::{debug, error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Camera footage import daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the job worker and process submitted commands (default)
    Run,
    /// Validate an import request and queue its scan
    Scan(ScanArgs),
    /// Queue the encode of a finished scan's plan
    Encode { scan_job: String },
    /// Show one job with its plan
    Status { job_id: String },
    /// List jobs, newest first
    List {
        #[arg(long)]
        active: bool,
        /// 0 lists everything
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Request cancellation of a job
    Cancel { job_id: String },
    /// Request cancellation of every active job
    CancelAll,
    /// Try a path-time regex against a sample path
    TestRegex { pattern: String, sample: String },
    /// Print the next free batch number for an experiment/treatment
    NextBatch {
        #[arg(long)]
        facility: String,
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        treatment: String,
    },
}

#[derive(ClapArgs, Debug)]
struct ScanArgs {
    #[arg(long)]
    facility: String,
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    treatment: String,
    /// YYYY-MM-DD
    #[arg(long)]
    start_date: String,
    /// YYYY-MM-DD
    #[arg(long)]
    end_date: String,
    /// H:MM
    #[arg(long)]
    start_time: String,
    /// H:MM
    #[arg(long)]
    end_time: String,
    /// Comma separated; defaults to every camera of the facility
    #[arg(long, value_delimiter = ',')]
    cameras: Vec<u32>,
    #[arg(long)]
    batch: Option<u32>,
    #[arg(long)]
    camera_pattern: Option<String>,
    #[arg(long)]
    path_time_regex: Option<String>,
    /// Queue the encode as soon as the scan finishes
    #[arg(long)]
    auto_encode: bool,
}

impl From<ScanArgs> for ImportRequest {
    fn from(a: ScanArgs) -> Self {
        ImportRequest {
            facility: a.facility,
            experiment: a.experiment,
            treatment: a.treatment,
            batch: a.batch,
            start_date: a.start_date,
            end_date: a.end_date,
            start_time: a.start_time,
            end_time: a.end_time,
            cameras: a.cameras,
            camera_pattern: a.camera_pattern,
            path_time_regex: a.path_time_regex,
            auto_encode: a.auto_encode,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only changes the default
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = ImporterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run_daemon(cfg).await,
        Cmd::Scan(scan) => {
            let request = ImportRequest::from(scan);
            let prepared = import::prepare(&cfg, &request)?;
            println!("{}", prepared.title());
            submit(&cfg, CommandAction::Scan { request: prepared.request })
        }
        Cmd::Encode { scan_job } => submit(&cfg, CommandAction::Encode { source_job: scan_job }),
        Cmd::Status { job_id } => {
            let jobs = load_jobs(&cfg)?;
            let Some(job) = jobs.iter().find(|j| j.id == job_id) else {
                bail!("Job {} not found", job_id);
            };
            println!("{}", serde_json::to_string_pretty(&JobReport::from(job))?);
            Ok(())
        }
        Cmd::List { active, limit } => {
            let jobs = load_jobs(&cfg)?;
            let shown = jobs
                .iter()
                .filter(|j| !active || j.is_active())
                .take(if limit == 0 { usize::MAX } else { limit });
            for job in shown {
                println!(
                    "{}  {:<9}  {:>4}/{:<4}  {:<13}  {}  {}",
                    job.id,
                    job.status.as_str(),
                    job.progress,
                    job.total,
                    job.kind,
                    job.title,
                    job.message
                );
            }
            Ok(())
        }
        Cmd::Cancel { job_id } => submit(&cfg, CommandAction::Cancel { target: job_id }),
        Cmd::CancelAll => submit(&cfg, CommandAction::CancelAll),
        Cmd::TestRegex { pattern, sample } => {
            let result = locator::test_path_regex(&pattern, &sample)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Cmd::NextBatch { facility, experiment, treatment } => {
            let facility = cfg.facility(&facility)?;
            let dir = batch_dir(&facility.output_dir, &experiment, &treatment);
            println!("{}", next_batch_number(&dir));
            Ok(())
        }
    }
}

/// Write a command file and print the job id it will run under
fn submit(cfg: &ImporterConfig, action: CommandAction) -> Result<()> {
    let cmd = CommandFile::new(action);
    let path = commands::submit_command(&cfg.command_dir(), &cmd)?;
    debug!("Command written to {}", path.display());
    match &cmd.job_id {
        Some(id) => println!("{}", id),
        None => println!("submitted"),
    }
    Ok(())
}

/// Persisted jobs, newest first
fn load_jobs(cfg: &ImporterConfig) -> Result<Vec<Job>> {
    let mut jobs = load_snapshot(&cfg.state_file()).context("Failed to load jobs")?;
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(jobs)
}

async fn run_daemon(cfg: ImporterConfig) -> Result<()> {
    info!("Import daemon starting");
    info!("Configuration loaded:");
    info!("  Facilities: {:?}", cfg.facility_names());
    info!("  Working dir: {}", cfg.working_dir.display());
    info!("  Job state dir: {}", cfg.job_state_dir.display());
    info!("  Encoder: {}", cfg.encoder_bin.display());
    info!("  Finished jobs kept: {}", cfg.job_retention);

    for name in cfg.facility_names() {
        match cfg.facility(&name) {
            Ok(fac) if fac.source_dir.exists() => info!("Facility {}: source {}", name, fac.source_dir.display()),
            Ok(fac) => warn!("Facility {}: source does not exist: {}", name, fac.source_dir.display()),
            Err(e) => warn!("Facility {}: {}", name, e),
        }
    }

    let command_dir = cfg.command_dir();
    fs::create_dir_all(&command_dir)
        .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;

    let cfg = Arc::new(cfg);
    let queue = TaskQueue::open(cfg.state_file());
    queue.set_retention(cfg.job_retention);
    import::register_resumers(&queue, cfg.clone());

    info!("🔄 Resuming unfinished jobs...");
    let resumed = queue.resume_pending();
    info!(
        "✅ Startup recovery complete: {} resumed, {} cancelled, {} failed",
        resumed.resumed, resumed.cancelled, resumed.failed
    );
    queue.start();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.command_poll_interval_ms.max(50)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match commands::drain_commands(&command_dir) {
                    Ok(cmds) => {
                        if !cmds.is_empty() {
                            info!("Processing {} command file(s)", cmds.len());
                        }
                        for cmd in cmds {
                            commands::dispatch(&queue, cfg.clone(), cmd);
                        }
                    }
                    Err(e) => error!("Failed to process command files: {:#}", e),
                }
            }
            res = &mut shutdown => {
                res.context("Failed to listen for shutdown signal")?;
                let active = queue.list(true, 0).len();
                info!("Shutting down; {} unfinished job(s) resume on next start", active);
                break;
            }
        }
    }
    Ok(())
}
