use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use build_coordinator::build::{BuildJob, BuildJobState, BuildStage, RunnerType, StartBuild};
use build_coordinator::config::HostConfig;
use build_coordinator::host::{Host, HostStores};
use build_coordinator::outbox::OutboxMessage;
use build_coordinator::pipeline::{SimulatedPreprocessJob, SimulatedTrainJob};
use build_coordinator::platform::LoggingPlatformApi;
use build_coordinator::shutdown::install_shutdown_handler;
use build_coordinator::store::Repository;

#[derive(Parser, Debug)]
#[command(name = "build-coordinator")]
#[command(version)]
#[command(about = "Lease-locked build job coordination with an ordered delivery outbox")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a coordinator host until SIGINT/SIGTERM
    Serve(ServeArgs),

    /// Run the demo pipeline against an in-process host and print a summary
    Simulate(SimulateArgs),
}

// =============================================================================
// Host Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct HostArgs {
    /// Host identity stamped on every lease (random when omitted)
    #[arg(long)]
    host_id: Option<String>,

    /// Directory for oversized outbox payloads (in memory when omitted)
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Default lock lease in seconds (leases never expire when omitted)
    #[arg(long)]
    lease_secs: Option<u64>,

    /// Concurrent jobs on the CPU queue
    #[arg(long, default_value = "4")]
    cpu_workers: usize,

    /// Concurrent jobs on the GPU queue
    #[arg(long, default_value = "1")]
    gpu_workers: usize,

    /// Hours after which a message failing with a retryable error is dropped
    #[arg(long, default_value = "48")]
    message_expiration_hours: u64,
}

impl HostArgs {
    fn to_config(&self) -> HostConfig {
        let mut config = match &self.host_id {
            Some(host_id) => HostConfig::new(host_id.clone()),
            None => HostConfig::default(),
        };
        if let Some(secs) = self.lease_secs {
            config = config.with_lease(Duration::from_secs(secs));
        }
        if let Some(dir) = &self.blob_dir {
            config = config.with_blob_dir(dir.clone());
        }
        config
            .with_workers(self.cpu_workers, self.gpu_workers)
            .with_message_expiration(Duration::from_secs(self.message_expiration_hours * 60 * 60))
    }
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    host: HostArgs,
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    host: HostArgs,

    /// Number of engines to build
    #[arg(long, default_value = "3")]
    engines: usize,

    /// How many of the builds to cancel while they run
    #[arg(long, default_value = "0")]
    cancel: usize,

    /// Duration of one simulated work step, in milliseconds
    #[arg(long, default_value = "100")]
    step_ms: u64,

    /// Give up waiting for builds after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn demo_jobs(step_delay: Duration) -> Vec<Arc<dyn BuildJob>> {
    vec![
        Arc::new(SimulatedPreprocessJob {
            step_delay,
            ..SimulatedPreprocessJob::default()
        }),
        Arc::new(SimulatedTrainJob {
            step_delay,
            ..SimulatedTrainJob::default()
        }),
    ]
}

// =============================================================================
// Serve
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.host.to_config();
    tracing::info!(
        host_id = %config.host_id,
        blob_dir = ?config.blob_dir,
        lease = ?config.locks.default_lease,
        cpu_workers = config.workers.cpu_concurrency,
        gpu_workers = config.workers.gpu_concurrency,
        "Starting build coordinator"
    );

    let stores = HostStores::from_config(&config);
    let host = Host::new(
        config,
        stores,
        Arc::new(LoggingPlatformApi),
        demo_jobs(Duration::from_millis(500)),
    );
    let shutdown = install_shutdown_handler();
    host.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Simulate
// =============================================================================

#[derive(Debug, Serialize)]
struct SimulationRow {
    engine_id: String,
    build_id: String,
    cancel_result: Option<String>,
    build_revision: u64,
    still_building: bool,
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    host_id: String,
    engines: Vec<SimulationRow>,
    undelivered_messages: usize,
    elapsed_ms: u128,
}

async fn run_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let config = args.host.to_config();
    let stores = HostStores::from_config(&config);
    let host = Arc::new(Host::new(
        config,
        stores.clone(),
        Arc::new(LoggingPlatformApi),
        demo_jobs(Duration::from_millis(args.step_ms)),
    ));

    let shutdown = install_shutdown_handler();
    let host_shutdown = shutdown.child_token();
    let runner = host.clone();
    let host_token = host_shutdown.clone();
    let host_task = tokio::spawn(async move { runner.run(host_token).await });

    let mut rows = Vec::with_capacity(args.engines);
    for i in 0..args.engines {
        let engine_id = format!("engine{}", i + 1);
        let build_id = format!("build{}", i + 1);
        host.service.create_engine(&engine_id, "demo", None).await?;
        host.service
            .start_build_job(StartBuild::new(
                RunnerType::Cpu,
                "demo",
                engine_id.clone(),
                build_id.clone(),
                BuildStage::Preprocess,
            ))
            .await?;
        rows.push(SimulationRow {
            engine_id,
            build_id,
            cancel_result: None,
            build_revision: 0,
            still_building: true,
        });
    }

    // Let the first stage get going before canceling.
    tokio::time::sleep(Duration::from_millis(args.step_ms)).await;
    for row in rows.iter_mut().take(args.cancel) {
        let (build_id, state) = host.service.cancel_build_job(&row.engine_id).await?;
        row.cancel_result = Some(match build_id {
            Some(_) => state.to_string(),
            None => BuildJobState::None.to_string(),
        });
    }

    let deadline = started + Duration::from_secs(args.timeout_secs);
    let mut undelivered = 0;
    while Instant::now() < deadline && !shutdown.is_cancelled() {
        let mut building = false;
        for row in &rows {
            building |= host.service.is_engine_building(&row.engine_id).await?;
        }
        undelivered = stores
            .messages
            .get_all(&|_: &OutboxMessage| true)
            .await?
            .len();
        if !building && undelivered == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for row in rows.iter_mut() {
        if let Some(engine) = host.service.get_engine(&row.engine_id).await? {
            row.build_revision = engine.build_revision;
            row.still_building = engine.current_build.is_some();
        }
    }

    host_shutdown.cancel();
    host_task.await??;

    let summary = SimulationSummary {
        host_id: host.config.host_id.clone(),
        engines: rows,
        undelivered_messages: undelivered,
        elapsed_ms: started.elapsed().as_millis(),
    };
    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Table => {
            println!("Simulation on host {}", summary.host_id);
            println!("{}", "=".repeat(60));
            println!(
                "{:<12} {:<10} {:<12} {:<10} BUILDING",
                "ENGINE", "BUILD", "CANCEL", "REVISION"
            );
            println!("{}", "-".repeat(60));
            for row in &summary.engines {
                println!(
                    "{:<12} {:<10} {:<12} {:<10} {}",
                    row.engine_id,
                    row.build_id,
                    row.cancel_result.as_deref().unwrap_or("-"),
                    row.build_revision,
                    if row.still_building { "yes" } else { "no" }
                );
            }
            println!();
            println!("Undelivered messages: {}", summary.undelivered_messages);
            println!("Elapsed: {} ms", summary.elapsed_ms);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Serve(serve_args) => {
            run_serve(serve_args).await?;
        }
        Commands::Simulate(simulate_args) => {
            run_simulate(simulate_args).await?;
        }
    }

    Ok(())
}
