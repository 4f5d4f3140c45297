use anyhow::{Context, Result};
use clap::Parser;
use importer::{
    commands::{submit_command, CommandAction, CommandFile},
    config::ImporterConfig,
    job::{load_snapshot, Job, JobStatus},
    plan::{DayCounts, ImportPlan},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use humansize::{format_size, DECIMAL};

struct App {
    jobs: Vec<Job>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    state_file: PathBuf,
    command_dir: PathBuf,
    notice: Option<String>,
}

impl App {
    fn new(state_file: PathBuf, command_dir: PathBuf) -> Self {
        Self {
            jobs: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            state_file,
            command_dir,
            notice: None,
        }
    }

    fn refresh(&mut self) -> Result<()> {
        self.system.refresh_all();

        // A snapshot being replaced mid-read shows as an empty table for one tick
        match load_snapshot(&self.state_file) {
            Ok(jobs) => {
                self.jobs = jobs;
                self.jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            Err(_e) => {
                self.jobs = Vec::new();
            }
        }

        match self.table_state.selected() {
            Some(i) if i >= self.jobs.len() => {
                self.table_state.select(self.jobs.len().checked_sub(1));
            }
            None if !self.jobs.is_empty() => self.table_state.select(Some(0)),
            _ => {}
        }
        Ok(())
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    fn select_next(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        let i = self.table_state.selected().map(|i| (i + 1).min(self.jobs.len() - 1)).unwrap_or(0);
        self.table_state.select(Some(i));
    }

    fn select_previous(&mut self) {
        let i = self.table_state.selected().map(|i| i.saturating_sub(1)).unwrap_or(0);
        self.table_state.select(Some(i));
    }

    fn selected_job(&self) -> Option<&Job> {
        self.table_state.selected().and_then(|i| self.jobs.get(i))
    }

    /// Ask the daemon to cancel the selected job
    fn cancel_selected(&mut self) {
        let Some(job) = self.selected_job() else {
            return;
        };
        if !job.is_active() {
            self.notice = Some(format!("{} already {}", short_id(&job.id), job.status));
            return;
        }
        let id = job.id.clone();
        let cmd = CommandFile::new(CommandAction::Cancel { target: id.clone() });
        self.notice = Some(match submit_command(&self.command_dir, &cmd) {
            Ok(_) => format!("cancel requested for {}", short_id(&id)),
            Err(e) => format!("cancel failed: {:#}", e),
        });
    }

    /// The job the worker is on, if any
    fn running_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.status == JobStatus::Running)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = ImporterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg.state_file(), cfg.command_dir());

    loop {
        app.refresh()?;
        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(250))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                if key.kind != crossterm::event::KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    crossterm::event::KeyCode::Char('q') => {
                        app.should_quit = true;
                    }
                    crossterm::event::KeyCode::Char('r') => {
                        app.refresh()?;
                    }
                    crossterm::event::KeyCode::Char('c') => app.cancel_selected(),
                    crossterm::event::KeyCode::Down => app.select_next(),
                    crossterm::event::KeyCode::Up => app.select_previous(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

/// Camera import monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // CPU / memory / active job
            Constraint::Min(3),    // job table
            Constraint::Length(3), // status bar
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);
    render_job_table(f, app, main_chunks[1]);
    render_status_bar(f, app, main_chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(50),
        ])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    let (title, ratio, label) = match app.running_job() {
        Some(job) => (
            truncate_string(&job.title, 40),
            progress_ratio(job.progress, job.total),
            format!("{}/{} {}", job.progress, job.total, truncate_string(&job.message, 40)),
        ),
        None => ("Idle".to_string(), 0.0, "no running job".to_string()),
    };
    let job_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(ratio)
        .label(label);
    f.render_widget(job_gauge, chunks[2]);
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "KIND", "TITLE", "PROG", "DAYS", "SIZE", "TIME", "MESSAGE"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.jobs.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            format!("State: {}", app.state_file.display()),
        ])]
    } else {
        app.jobs
            .iter()
            .map(|job| {
                let plan = job
                    .meta
                    .get("plan")
                    .and_then(|p| serde_json::from_value::<ImportPlan>(p.clone()).ok());
                let days = plan
                    .as_ref()
                    .map(|p| format_counts(&p.counts()))
                    .unwrap_or_else(|| "-".to_string());
                let size = plan
                    .as_ref()
                    .map(|p| p.days().filter_map(|d| d.output_bytes).sum::<u64>())
                    .filter(|b| *b > 0)
                    .map(|b| format_size(b, DECIMAL))
                    .unwrap_or_else(|| "-".to_string());

                let duration = match (job.started_at, job.finished_at) {
                    (Some(started), Some(finished)) => format!("{}s", (finished - started).num_seconds()),
                    (Some(started), None) => format!("{}s", (chrono::Utc::now() - started).num_seconds()),
                    _ => "-".to_string(),
                };
                let kind = job.kind.rsplit('.').next().unwrap_or(&job.kind).to_string();

                Row::new(vec![
                    status_label(job).to_string(),
                    kind,
                    truncate_string(&job.title, 40),
                    format!("{}/{}", job.progress, job.total),
                    days,
                    size,
                    duration,
                    truncate_string(&job.message, 60),
                ])
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(7),
        Constraint::Percentage(30),
        Constraint::Length(7),
        Constraint::Length(14),
        Constraint::Length(9),
        Constraint::Length(7),
        Constraint::Percentage(40),
    ];

    let title = format!("Jobs ({})", app.jobs.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let status_text = format!(
        "Total: {} | Queued: {} | Running: {} | Done: {} | Failed: {} | Cancelled: {} | {} | q=quit r=refresh c=cancel",
        app.jobs.len(),
        app.count_by_status(JobStatus::Queued),
        app.count_by_status(JobStatus::Running),
        app.count_by_status(JobStatus::Done),
        app.count_by_status(JobStatus::Failed),
        app.count_by_status(JobStatus::Cancelled),
        app.notice.as_deref().unwrap_or("-"),
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn status_label(job: &Job) -> &'static str {
    match job.status {
        JobStatus::Queued if job.cancel.is_set() => "CXL?",
        JobStatus::Queued => "QUE",
        JobStatus::Running if job.cancel.is_set() => "STOP",
        JobStatus::Running => "RUN",
        JobStatus::Done => "OK",
        JobStatus::Failed => "FAIL",
        JobStatus::Cancelled => "CXL",
    }
}

/// `done/failed/missing` day counts
fn format_counts(counts: &DayCounts) -> String {
    format!("{}✓ {}✗ {}∅", counts.done, counts.failed, counts.missing)
}

fn progress_ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
