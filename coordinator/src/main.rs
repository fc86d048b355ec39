//! Step-synchronized worker pool coordinator.
//!
//! `serve` spawns worker subprocesses (by default this same binary in
//! `worker` mode), waits for all of them to dial back in, runs a number of
//! steps and shuts the pool down. `worker` runs one synthetic worker.
//!
//! # Usage
//!
//! ```bash
//! # Four workers, ten steps of 32 units each
//! sync-coordinator serve --workers 4 --batch-size 32 --steps 10
//!
//! # With a configuration file
//! sync-coordinator serve --config coordinator.toml
//!
//! # Run a worker by hand against a running coordinator
//! sync-coordinator worker --address 127.0.0.1:4100 --identity 0
//! ```

mod worker;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_core::config::WorkerConfig;
use sync_core::{
    CoordinatorConfig, LifecycleSupervisor, ProcessSpawner, RetryConfig, SyncError, WorkerClient,
};
use worker::SyntheticWorker;

#[derive(Parser, Debug)]
#[command(name = "sync-coordinator")]
#[command(about = "Coordinator for step-synchronized TCP worker pools")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn workers and drive steps
    Serve(ServeArgs),
    /// Run one synthetic worker
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short, long)]
    address: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of workers (clamped to available CPUs)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Units of work per step
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Bad samples tolerated per worker per step
    #[arg(long)]
    max_wrong_samples: Option<u32>,

    /// Per-step timeout in milliseconds (0 disables)
    #[arg(long)]
    step_timeout_ms: Option<u64>,

    /// Number of steps to run (0 runs until interrupted)
    #[arg(long, default_value = "1")]
    steps: u64,

    /// Worker executable (defaults to this binary in worker mode)
    #[arg(long)]
    worker_program: Option<PathBuf>,

    /// Passed to spawned synthetic workers
    #[arg(long, default_value = "0")]
    reject_every: u64,

    /// Passed to spawned synthetic workers
    #[arg(long, default_value = "64")]
    payload_bytes: usize,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Coordinator address (host:port)
    #[arg(short, long)]
    address: String,

    /// Identity announced during handshake
    #[arg(short, long)]
    identity: u32,

    /// Report every K-th attempt as a bad sample (0 never)
    #[arg(long, default_value = "0")]
    reject_every: u64,

    /// Size of each produced sample in bytes
    #[arg(long, default_value = "64")]
    payload_bytes: usize,

    /// Connection attempts before giving up
    #[arg(long, default_value = "10")]
    connect_retries: u32,

    /// Delay before the first reconnect in milliseconds
    #[arg(long, default_value = "50")]
    retry_delay_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds
    #[arg(long, default_value = "2000")]
    max_retry_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Serve(args) => serve(args, &cli.log_level).await?,
        Command::Worker(args) => run_worker(args).await?,
    }
    Ok(())
}

fn load_config(args: &ServeArgs) -> sync_core::Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    }
    .with_env_overrides();

    if let Some(address) = &args.address {
        config.server.address = address.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(workers) = args.workers {
        config.pool.worker_count = workers;
    }
    if let Some(batch_size) = args.batch_size {
        config.step.batch_size = batch_size;
    }
    if let Some(limit) = args.max_wrong_samples {
        config.step.max_wrong_samples_per_step = limit;
    }
    if let Some(timeout) = args.step_timeout_ms {
        config.step.step_timeout_ms = timeout;
    }

    config.pool = config.pool.clamped_to_cpus();
    config.validate()?;
    Ok(config)
}

async fn serve(args: ServeArgs, log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;

    let program = match &args.worker_program {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };
    let spawner = ProcessSpawner::new(program)
        .args(["--log-level", log_level, "worker"])
        .args(["--address", "{address}", "--identity", "{identity}"])
        .arg(format!("--reject-every={}", args.reject_every))
        .arg(format!("--payload-bytes={}", args.payload_bytes))
        .arg(format!("--connect-retries={}", config.worker.connect_retries))
        .arg(format!("--retry-delay-ms={}", config.worker.retry_delay_ms))
        .arg(format!("--max-retry-delay-ms={}", config.worker.max_retry_delay_ms));

    tracing::info!("Starting sync coordinator");
    tracing::info!("  Workers: {}", config.pool.worker_count);
    tracing::info!("  Batch size: {}", config.step.batch_size);
    tracing::info!("  Max wrong samples per step: {}", config.step.max_wrong_samples_per_step);
    tracing::info!("  Partition: {:?}", config.step.partition);

    let mut supervisor = LifecycleSupervisor::start(&config, &spawner).await?;
    tracing::info!("Listening on {}", supervisor.local_addr());

    let outcome = tokio::select! {
        result = run_steps(&mut supervisor, args.steps, config.step.batch_size) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down...");
            Ok(())
        }
    };

    let summary = supervisor.shutdown().await;
    if !summary.is_clean() {
        tracing::warn!(
            "unclean shutdown: forced {:?}, lost {:?}",
            summary.forced,
            summary.lost
        );
    }
    outcome?;
    Ok(())
}

async fn run_steps(
    supervisor: &mut LifecycleSupervisor,
    steps: u64,
    batch_size: usize,
) -> sync_core::Result<()> {
    let mut completed = 0u64;
    while steps == 0 || completed < steps {
        completed += 1;
        match supervisor.run_step(batch_size).await {
            Ok(batch) => {
                let bytes: usize = batch.payloads().map(|p| p.len()).sum();
                tracing::info!(
                    "step {}: {} samples, {} bytes, {} bad samples retried",
                    batch.step_index,
                    batch.len(),
                    bytes,
                    batch.total_wrong_samples()
                );
                if !batch.is_complete() {
                    tracing::warn!(
                        "step {} is short: {}/{} samples, workers {:?} exited",
                        batch.step_index,
                        batch.len(),
                        batch.requested,
                        batch.exited_workers
                    );
                }
            }
            Err(e) if e.is_step_local() => {
                tracing::warn!("step failed, continuing: {}", e);
            }
            Err(SyncError::NoAvailableWorkers) => {
                tracing::warn!("no workers left, stopping after {} steps", completed - 1);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let retry = RetryConfig::from(&WorkerConfig {
        connect_retries: args.connect_retries,
        retry_delay_ms: args.retry_delay_ms,
        max_retry_delay_ms: args.max_retry_delay_ms,
    });
    let client = WorkerClient::connect(&args.address, args.identity, &retry).await?;
    let mut handler = SyntheticWorker::new(args.identity, args.reject_every, args.payload_bytes);
    let stats = client.run(&mut handler).await?;
    tracing::info!(
        "worker {} done: {} requests, {} samples, {} bad samples",
        args.identity,
        stats.requests,
        stats.samples,
        stats.bad_samples
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_args_carry_retry_policy() {
        let cli = Cli::try_parse_from([
            "sync-coordinator",
            "worker",
            "--address",
            "127.0.0.1:4100",
            "--identity",
            "3",
            "--connect-retries=4",
            "--retry-delay-ms=10",
            "--max-retry-delay-ms=500",
        ])
        .unwrap();
        let Command::Worker(args) = cli.command else {
            panic!("expected worker mode");
        };
        assert_eq!(args.connect_retries, 4);
        assert_eq!(args.retry_delay_ms, 10);
        assert_eq!(args.max_retry_delay_ms, 500);
    }
}
