use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use batchrun::batch::JobInput;
use batchrun::config::{FetchPolicy, RunOptions, SchedulerKind, WaitMode};
use batchrun::error::JobResult;
use batchrun::progress::TracingObserver;
use batchrun::runner::Runner;
use batchrun::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "batchrun")]
#[command(version)]
#[command(about = "Run batch jobs locally or on SLURM clusters, skipping work already done")]
#[command(propagate_version = true)]
struct Args {
    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the jobs described in a JSON file
    Run {
        /// JSON file with a task, a job record or a list of them
        file: PathBuf,

        #[command(flatten)]
        options: OptionArgs,
    },
    /// Refresh the status of submitted jobs
    Status {
        /// JSON files or stored job ids
        #[arg(required = true)]
        inputs: Vec<String>,

        #[command(flatten)]
        options: OptionArgs,
    },
    /// Copy results of finished jobs back
    Fetch {
        /// JSON files or stored job ids
        #[arg(required = true)]
        inputs: Vec<String>,

        #[command(flatten)]
        options: OptionArgs,
    },
}

#[derive(clap::Args, Debug)]
struct OptionArgs {
    /// Job store file (default: in-memory)
    #[arg(long)]
    database: Option<String>,

    /// Override the scheduler of every task (local, slurm)
    #[arg(long, value_parser = parse_scheduler)]
    scheduler: Option<SchedulerKind>,

    /// Wait for jobs, up to the budget derived from their tasks
    #[arg(long)]
    wait: bool,

    /// Wait for jobs, at most this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Resolve files and render scripts without submitting
    #[arg(long)]
    dry_run: bool,

    /// Ignore completed runs in the store
    #[arg(long)]
    force_recompute: bool,

    /// Copy back the whole remote work directory
    #[arg(long)]
    fetch_all: bool,

    /// Groups processed concurrently
    #[arg(long, default_value = "4")]
    workers: usize,
}

impl OptionArgs {
    fn run_options(&self) -> RunOptions {
        let wait = match (self.timeout, self.wait) {
            (Some(secs), _) => WaitMode::Timeout(Duration::from_secs(secs)),
            (None, true) => WaitMode::Derived,
            (None, false) => WaitMode::NoWait,
        };
        let mut options = RunOptions::default()
            .with_wait(wait)
            .with_dry_run(self.dry_run)
            .with_force_recompute(self.force_recompute)
            .with_max_workers(self.workers)
            .with_fetch_policy(if self.fetch_all {
                FetchPolicy::WorkDir
            } else {
                FetchPolicy::Declared
            });
        if let Some(database) = &self.database {
            options = options.with_database(database.clone());
        }
        if let Some(kind) = self.scheduler {
            options = options.with_scheduler(kind);
        }
        options
    }
}

fn parse_scheduler(s: &str) -> Result<SchedulerKind, String> {
    s.parse().map_err(|e: batchrun::error::RunError| e.to_string())
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobOutput {
    position: usize,
    store_id: Option<u64>,
    job_id: Option<u64>,
    name: Option<String>,
    hash: Option<String>,
    status: Option<String>,
    returncodes: Vec<Option<i32>>,
    error: Option<String>,
    #[serde(skip)]
    failed: bool,
}

impl JobOutput {
    fn from_result(position: usize, result: &JobResult) -> Self {
        match result {
            Ok(job) => {
                let handle = job.handle();
                let errors: Vec<&str> = job
                    .outputs
                    .iter()
                    .filter_map(|o| o.error.as_deref())
                    .collect();
                Self {
                    position,
                    store_id: handle.store_id,
                    job_id: handle.id,
                    name: Some(handle.name),
                    hash: handle.hash,
                    status: Some(handle.status.to_string()),
                    returncodes: job.outputs.iter().map(|o| o.returncode).collect(),
                    error: (!errors.is_empty()).then(|| errors.join("; ")),
                    failed: job.status.is_terminal() && !job.is_success(),
                }
            }
            Err(e) => Self {
                position,
                store_id: None,
                job_id: None,
                name: None,
                hash: None,
                status: None,
                returncodes: Vec::new(),
                error: Some(e.to_string()),
                failed: true,
            },
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn read_input(path: &PathBuf) -> Result<JobInput, Box<dyn std::error::Error>> {
    let data = tokio::fs::read(path).await?;
    let value: serde_json::Value = serde_json::from_slice(&data)?;
    Ok(JobInput::from_json(value)?)
}

/// Numbers are store ids, everything else a JSON file.
async fn read_inputs(inputs: &[String]) -> Result<JobInput, Box<dyn std::error::Error>> {
    let mut items = Vec::with_capacity(inputs.len());
    for input in inputs {
        items.push(match input.parse::<u64>() {
            Ok(id) => JobInput::StoreId(id),
            Err(_) => read_input(&PathBuf::from(input)).await?,
        });
    }
    Ok(JobInput::Mixed(items))
}

fn print_results(
    results: &[JobResult],
    format: &OutputFormat,
) -> Result<usize, Box<dyn std::error::Error>> {
    let rows: Vec<JobOutput> = results
        .iter()
        .enumerate()
        .map(|(i, r)| JobOutput::from_result(i, r))
        .collect();
    let failed = rows.iter().filter(|r| r.failed).count();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No jobs.");
                return Ok(0);
            }
            println!(
                "{:<4} {:<8} {:<10} {:<12} {:<24} HASH",
                "#", "STORE", "JOB ID", "STATUS", "NAME"
            );
            println!("{}", "-".repeat(78));
            for row in &rows {
                let opt = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
                let hash = row
                    .hash
                    .as_deref()
                    .map(|h| &h[..h.len().min(12)])
                    .unwrap_or("-");
                println!(
                    "{:<4} {:<8} {:<10} {:<12} {:<24} {}",
                    row.position,
                    opt(row.store_id),
                    opt(row.job_id),
                    row.status.as_deref().unwrap_or("ERROR"),
                    row.name.as_deref().unwrap_or("-"),
                    hash
                );
                if let Some(error) = &row.error {
                    println!("     error: {}", error);
                }
            }
            println!();
            println!("{} of {} jobs failed", failed, rows.len());
        }
    }
    Ok(failed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = install_shutdown_handler();
    let runner = Runner::new()
        .with_observer(Arc::new(TracingObserver))
        .with_cancel(cancel);

    let results = match &args.command {
        Commands::Run { file, options } => {
            let input = read_input(file).await?;
            runner.run(input, &options.run_options()).await?
        }
        Commands::Status { inputs, options } => {
            let input = read_inputs(inputs).await?;
            runner.get_status(input, &options.run_options()).await?
        }
        Commands::Fetch { inputs, options } => {
            let input = read_inputs(inputs).await?;
            runner.fetch_results(input, &options.run_options()).await?
        }
    };

    let failed = print_results(&results, &args.output)?;
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
