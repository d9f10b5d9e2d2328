use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use jobfleet::config::{
    DockerConfig, FleetConfig, ProviderConfig, SchedulerConfig, ShutdownPolicy,
};
use jobfleet::error::FleetError;
use jobfleet::node::Node;
use jobfleet::scheduler::{Job, JobId, JobStatus};
use jobfleet::shutdown::install_shutdown_handler;
use jobfleet::store::SqliteJobStore;

/// Exit status for configuration the scheduler refuses to start with.
const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "jobfleet")]
#[command(version)]
#[command(about = "Leases ephemeral workers to queued jobs under a concurrency ceiling")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation scheduler until interrupted
    Serve(ServeArgs),

    /// Job management commands
    Job {
        /// SQLite database holding the jobs table
        #[arg(long, env = "JOBFLEET_DATABASE", default_value = "jobfleet.db")]
        database: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Identity tag applied to launched workers
    #[arg(long, env = "JOBFLEET_SCHEDULER_ID", default_value = "jobfleet")]
    scheduler_id: String,

    /// Maximum number of simultaneously active workers
    #[arg(long, env = "JOBFLEET_CEILING", default_value = "2")]
    ceiling: usize,

    /// Seconds between ticks
    #[arg(long, env = "JOBFLEET_POLL_INTERVAL", default_value = "30")]
    poll_interval_secs: u64,

    /// Timeout in seconds for each store or provider call
    #[arg(long, default_value = "10")]
    call_timeout_secs: u64,

    /// Re-issue a stop after this many seconds without the worker stopping
    #[arg(long, default_value = "300")]
    stop_retry_secs: u64,

    /// Stop every worker on shutdown instead of leaving them running
    #[arg(long)]
    drain_on_shutdown: bool,

    /// Skip rebuilding the registry from the provider at startup
    #[arg(long)]
    no_recover: bool,

    /// SQLite database holding the jobs table
    #[arg(long, env = "JOBFLEET_DATABASE", default_value = "jobfleet.db")]
    database: PathBuf,

    /// Worker provider
    #[arg(long, default_value = "docker")]
    provider: ProviderKind,

    /// Worker image (docker provider)
    #[arg(long, env = "JOBFLEET_IMAGE", default_value = "jobfleet-worker:latest")]
    image: String,

    /// Command run inside each worker container
    #[arg(long, num_args = 1.., value_delimiter = ' ')]
    worker_command: Vec<String>,

    /// Docker network for worker containers
    #[arg(long)]
    network: Option<String>,

    /// Memory limit per worker container (e.g., "512m")
    #[arg(long, default_value = "512m")]
    memory: String,

    /// CPU limit per worker container (e.g., "1.0")
    #[arg(long, default_value = "1.0")]
    cpus: String,

    /// Extra worker environment, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Let docker remove worker containers once they exit
    #[arg(long)]
    remove_on_exit: bool,

    /// Port for the read-only status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[derive(Debug, Clone, ValueEnum)]
enum ProviderKind {
    Docker,
    Memory,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a new job
    Submit {
        /// Opaque parameters handed to the worker
        parameters: String,
    },
    /// List jobs
    List {
        /// Only show jobs in this status
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Record a job's outcome, as a worker would
    Finish {
        job_id: JobId,

        /// Mark the job FAILED instead of DONE
        #[arg(long)]
        failed: bool,
    },
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<Job>,
    total_count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn build_config(args: ServeArgs) -> Result<FleetConfig, FleetError> {
    let scheduler = SchedulerConfig {
        scheduler_id: args.scheduler_id,
        concurrency_ceiling: args.ceiling,
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        call_timeout: Duration::from_secs(args.call_timeout_secs),
        stop_retry_after: Duration::from_secs(args.stop_retry_secs),
        shutdown: if args.drain_on_shutdown {
            ShutdownPolicy::Drain
        } else {
            ShutdownPolicy::Leave
        },
        recover_on_start: !args.no_recover,
    };

    let provider = match args.provider {
        ProviderKind::Docker => ProviderConfig::Docker(DockerConfig {
            image: args.image,
            command: args.worker_command,
            network: args.network,
            memory_limit: Some(args.memory).filter(|m| !m.is_empty()),
            cpu_limit: Some(args.cpus).filter(|c| !c.is_empty()),
            env: args.env,
            remove_on_exit: args.remove_on_exit,
            ..DockerConfig::default()
        }),
        ProviderKind::Memory => ProviderConfig::Memory,
    };

    let dashboard_addr = args
        .dashboard_port
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)));

    let config = FleetConfig {
        scheduler,
        provider,
        database: args.database,
        dashboard_addr,
    };
    config.validate()?;
    Ok(config)
}

fn filter_by_status(jobs: Vec<Job>, status: Option<JobStatus>) -> Vec<Job> {
    jobs.into_iter()
        .filter(|job| status.is_none_or(|s| job.status == s))
        .collect()
}

fn print_jobs(jobs: Vec<Job>, output: &OutputFormat) -> Result<(), FleetError> {
    match output {
        OutputFormat::Json => {
            let total_count = jobs.len();
            let out = JobListOutput { jobs, total_count };
            println!(
                "{}",
                serde_json::to_string_pretty(&out).map_err(jobfleet::store::StoreError::from)?
            );
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<8} {:<10} {:<14} {:<26} PARAMETERS", "ID", "STATUS", "WORKER", "CREATED");
            println!("{}", "-".repeat(80));
            for job in &jobs {
                let params = if job.parameters.len() > 24 {
                    format!("{}...", job.parameters.chars().take(21).collect::<String>())
                } else {
                    job.parameters.clone()
                };
                println!(
                    "{:<8} {:<10} {:<14} {:<26} {}",
                    job.id,
                    job.status,
                    job.assigned_worker.as_deref().unwrap_or("-"),
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    params
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), FleetError> {
    let config = build_config(args)?;

    tracing::info!(
        scheduler_id = %config.scheduler.scheduler_id,
        ceiling = config.scheduler.concurrency_ceiling,
        database = %config.database.display(),
        dashboard_addr = ?config.dashboard_addr,
        "Starting jobfleet scheduler"
    );

    let node = Node::new(config).await?;
    let shutdown = install_shutdown_handler();
    node.run(shutdown).await
}

async fn run_job_command(
    store: SqliteJobStore,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), FleetError> {
    match command {
        JobCommands::Submit { parameters } => {
            let job = store.submit(parameters).await?;
            match output {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&job).map_err(jobfleet::store::StoreError::from)?
                ),
                OutputFormat::Table => println!("Job {} queued", job.id),
            }
        }
        JobCommands::List { status } => {
            let jobs = filter_by_status(store.all().await?, status);
            print_jobs(jobs, output)?;
        }
        JobCommands::Finish { job_id, failed } => {
            let status = if failed {
                JobStatus::Failed
            } else {
                JobStatus::Done
            };
            let job = store.set_status(job_id, status).await?;
            println!("Job {} is {}", job.id, job.status);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await,
        Commands::Job {
            database,
            output,
            command,
        } => match SqliteJobStore::open(&database).await {
            Ok(store) => run_job_command(store, command, &output).await,
            Err(e) => Err(e.into()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal_config() => {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
