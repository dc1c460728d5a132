//! `forgequeue` command line: `work`, `listen` and `restart`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use forgequeue_core::{CommandRegistry, WorkerOptions};
use forgequeue_infra::{FailedJobRecorder, QueueConfig, QueueManager};

use crate::listener::Listener;
use crate::probes::{FileMaintenanceMode, FileRestartSignal, RestartSignal};
use crate::signals::{self, WorkerState};
use crate::watchdog::Watchdog;
use crate::worker::Worker;

/// Config file read when `--config` is not given, if present.
const DEFAULT_CONFIG: &str = "queue.toml";

#[derive(Parser, Debug)]
#[command(name = "forgequeue", about, long_about = None, version)]
pub struct Cli {
    /// Path to the queue configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    /// Enables human-friendly logging.
    #[arg(short, long, global = true, default_value_t)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process jobs from a queue connection.
    Work(WorkArgs),
    /// Run every job in a fresh `work --once` child process.
    Listen(WorkerArgs),
    /// Ask running workers to exit after their current job.
    Restart,
}

#[derive(Args, Debug, Clone)]
pub struct WorkArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,
    /// Process a single job and exit.
    #[arg(long, default_value_t)]
    pub once: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Connection to work; defaults to the configured default connection.
    pub connection: Option<String>,
    /// Comma-separated queues, highest priority first.
    #[arg(long)]
    pub queue: Option<String>,
    /// Seconds before a failed job is retried.
    #[arg(long, default_value_t = 0)]
    pub delay: u64,
    /// Memory limit in megabytes.
    #[arg(long, default_value_t = 128)]
    pub memory: u64,
    /// Seconds to sleep when no job is available.
    #[arg(long, default_value_t = 3)]
    pub sleep: u64,
    /// Attempts before a job is failed (0 is unlimited).
    #[arg(long, default_value_t = 0)]
    pub tries: u32,
    /// Seconds a job may run before the worker is killed (0 is unlimited).
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,
    /// Keep working while the application is down for maintenance.
    #[arg(long, default_value_t)]
    pub force: bool,
}

impl WorkerArgs {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .with_delay(self.delay)
            .with_memory(self.memory)
            .with_sleep(self.sleep)
            .with_max_tries(self.tries)
            .with_timeout(self.timeout)
            .with_force(self.force)
    }

    fn queue(&self) -> &str {
        self.queue.as_deref().unwrap_or("")
    }

    fn connection<'a>(&'a self, manager: &'a QueueManager) -> &'a str {
        self.connection
            .as_deref()
            .unwrap_or_else(|| manager.default_connection_name())
    }
}

/// Parse the process arguments and run. `registry` holds the application's
/// commands and raw handlers.
pub async fn run(registry: CommandRegistry) -> ExitCode {
    run_with(Cli::parse(), registry).await
}

pub async fn run_with(cli: Cli, registry: CommandRegistry) -> ExitCode {
    if cli.debug {
        forgequeue_observability::init_pretty();
    } else {
        forgequeue_observability::init();
    }

    match execute(cli, registry).await {
        Ok(status) => ExitCode::from(status),
        Err(error) => {
            error!(error = %format!("{error:#}"), "queue command failed");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli, registry: CommandRegistry) -> Result<u8> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Restart => {
            let marker = FileRestartSignal::new(&config.worker.restart_marker);
            marker.signal(chrono::Utc::now().timestamp())?;
            info!(path = %marker.path().display(), "broadcast queue restart signal");
            Ok(0)
        }
        Commands::Work(args) => work(config, registry, args).await,
        Commands::Listen(args) => listen(cli.config, config, registry, args).await,
    }
}

async fn work(config: QueueConfig, registry: CommandRegistry, args: WorkArgs) -> Result<u8> {
    let paths = config.worker.clone();
    let manager = Arc::new(QueueManager::new(config, registry));
    let failed = manager
        .failed_provider()
        .context("failed to open the failed job store")?;
    manager.events().listen(FailedJobRecorder::new(failed));

    let state = WorkerState::new();
    signals::install(state.clone())?;

    let worker = Worker::new(manager.clone(), Watchdog::spawn()?)
        .with_state(state)
        .with_maintenance(Arc::new(FileMaintenanceMode::new(paths.maintenance_marker)))
        .with_restart_signal(Arc::new(FileRestartSignal::new(paths.restart_marker)));

    let options = args.worker.options();
    let connection = args.worker.connection(&manager).to_string();
    let queue = args.worker.queue();

    if args.once {
        worker.run_next_job(&connection, queue, &options).await?;
        return Ok(0);
    }

    let reason = worker.daemon(&connection, queue, &options).await?;
    Ok(exit_status(reason.exit_status()))
}

async fn listen(
    config_path: Option<PathBuf>,
    config: QueueConfig,
    registry: CommandRegistry,
    args: WorkerArgs,
) -> Result<u8> {
    // Resolve the connection here so a bad name fails once, not per child.
    let manager = QueueManager::new(config, registry);
    let connection = args.connection(&manager).to_string();
    manager.connection(Some(&connection))?;

    let state = WorkerState::new();
    signals::install(state.clone())?;

    let program = std::env::current_exe().context("cannot locate the worker executable")?;
    let listener = Listener::new(program)
        .with_config(config_path)
        .with_state(state);

    let status = listener
        .listen(&connection, args.queue(), &args.options())
        .await?;
    Ok(exit_status(status))
}

fn load_config(path: Option<&Path>) -> Result<QueueConfig> {
    let config = match path {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => QueueConfig::load(DEFAULT_CONFIG)?,
        None => QueueConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn exit_status(status: i32) -> u8 {
    u8::try_from(status).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_defaults_match_worker_options() {
        let cli = Cli::try_parse_from(["forgequeue", "work"]).unwrap();
        let Commands::Work(args) = cli.command else {
            panic!("expected work");
        };

        assert!(!args.once);
        assert_eq!(args.worker.connection, None);
        assert_eq!(args.worker.options(), WorkerOptions::default());
    }

    #[test]
    fn work_accepts_every_option() {
        let cli = Cli::try_parse_from([
            "forgequeue",
            "--debug",
            "work",
            "redis",
            "--queue=high,low",
            "--once",
            "--delay=5",
            "--memory=256",
            "--sleep=1",
            "--tries=3",
            "--timeout=0",
            "--force",
        ])
        .unwrap();

        assert!(cli.debug);
        let Commands::Work(args) = cli.command else {
            panic!("expected work");
        };
        assert!(args.once);
        assert_eq!(args.worker.connection.as_deref(), Some("redis"));
        assert_eq!(args.worker.queue(), "high,low");
        assert_eq!(
            args.worker.options(),
            WorkerOptions::default()
                .with_delay(5)
                .with_memory(256)
                .with_sleep(1)
                .with_max_tries(3)
                .with_timeout(0)
                .with_force(true)
        );
    }

    #[test]
    fn listener_child_args_parse_back() {
        let options = WorkerOptions::default().with_max_tries(2);
        let mut argv = vec!["forgequeue".to_string()];
        argv.extend(Listener::new("forgequeue").child_args("memory", "emails", &options));

        let cli = Cli::try_parse_from(argv).unwrap();
        let Commands::Work(args) = cli.command else {
            panic!("expected work");
        };
        assert!(args.once);
        assert_eq!(args.worker.queue(), "emails");
        assert_eq!(args.worker.options(), options);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn out_of_range_status_maps_to_failure() {
        assert_eq!(exit_status(12), 12);
        assert_eq!(exit_status(-1), 1);
    }
}
