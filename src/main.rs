use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use kronos::config::{KronosConfig, LimiterConfig, LoggingConfig};
use kronos::logging::TracingLogger;
use kronos::ratelimit::peak_admissions;

/// Drive a sliding-window rate limiter from concurrent workers.
#[derive(Parser, Debug)]
#[command(name = "kronos", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `kronos=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn workers that all acquire from one shared limiter
    Run(RunArgs),
    /// Single cross-process participant (spawned by `run --processes`)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct LimitArgs {
    /// Maximum admissions per window
    #[arg(long, allow_negative_numbers = true)]
    limit: Option<i64>,

    /// Window width in seconds
    #[arg(long, allow_negative_numbers = true)]
    period: Option<f64>,

    /// Ledger file shared between processes
    #[arg(long)]
    ledger: Option<PathBuf>,
}

impl LimitArgs {
    fn apply(&self, config: &mut LimiterConfig) {
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
        if let Some(period) = self.period {
            config.time_period_secs = period;
        }
        if let Some(ledger) = &self.ledger {
            config.ledger_path = Some(ledger.clone());
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Number of concurrent workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Admissions requested by each worker
    #[arg(long, default_value_t = 5)]
    calls: usize,

    /// Run workers as separate processes sharing a ledger file
    #[arg(long)]
    processes: bool,

    #[command(flatten)]
    limits: LimitArgs,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Worker number reported with each admission
    #[arg(long)]
    id: usize,

    /// Admissions to request
    #[arg(long)]
    calls: usize,

    #[command(flatten)]
    limits: LimitArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = KronosConfig::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.logging.json |= cli.log_json;
    init_tracing(&config.logging)?;

    match &cli.command {
        Command::Run(args) => run(config, args, &cli).await,
        Command::Worker(args) => worker(config, args).await,
    }
}

/// Install the global tracing subscriber. Logs go to stderr so stdout only
/// carries admission records.
fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log filter {:?}", config.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(mut config: KronosConfig, args: &RunArgs, cli: &Cli) -> anyhow::Result<()> {
    args.limits.apply(&mut config.limiter);

    info!("Starting Kronos rate limiter run");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if args.processes {
        run_processes(config.limiter, args, cli).await
    } else {
        run_threads(config.limiter, args).await
    }
}

async fn run_threads(config: LimiterConfig, args: &RunArgs) -> anyhow::Result<()> {
    let limiter = Arc::new(config.build(Arc::new(TracingLogger))?);
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(args.workers);
    for id in 0..args.workers {
        let limiter = Arc::clone(&limiter);
        let calls = args.calls;
        tasks.push(tokio::spawn(async move {
            let mut admitted = Vec::with_capacity(calls);
            for seq in 0..calls {
                let at = Arc::clone(&limiter).acquire_async().await?;
                report(id, seq, at)?;
                admitted.push(at);
            }
            anyhow::Ok(admitted)
        }));
    }

    let mut admitted = Vec::new();
    for task in tasks {
        admitted.extend(task.await??);
    }

    info!(
        admissions = admitted.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        observed_peak = peak_admissions(&admitted, limiter.time_period()),
        limit = limiter.limit(),
        "Run complete"
    );
    Ok(())
}

async fn run_processes(mut config: LimiterConfig, args: &RunArgs, cli: &Cli) -> anyhow::Result<()> {
    let scratch = config.ledger_path.is_none();
    let ledger = config
        .ledger_path
        .get_or_insert_with(|| std::env::temp_dir().join(format!("kronos-{}.ledger", std::process::id())))
        .clone();

    // Validate here so a bad configuration fails once instead of per child.
    let limit = config.limit()?;
    let period = config.time_period()?;
    let exe = std::env::current_exe().context("cannot locate the kronos executable")?;
    let started = Instant::now();

    info!(
        workers = args.workers,
        ledger = %ledger.display(),
        "Spawning worker processes"
    );

    let mut children = Vec::with_capacity(args.workers);
    for id in 0..args.workers {
        let mut command = tokio::process::Command::new(&exe);
        command
            .arg("worker")
            .arg("--id")
            .arg(id.to_string())
            .arg("--calls")
            .arg(args.calls.to_string())
            .arg("--limit")
            .arg(limit.to_string())
            .arg("--period")
            .arg(period.as_secs_f64().to_string())
            .arg("--ledger")
            .arg(&ledger);
        if let Some(config_path) = &cli.config {
            command.arg("--config").arg(config_path);
        }
        if let Some(level) = &cli.log_level {
            command.arg("--log-level").arg(level);
        }
        if cli.log_json {
            command.arg("--log-json");
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", id))?;
        children.push((id, child));
    }

    let mut failed = Vec::new();
    for (id, mut child) in children {
        let status = child.wait().await?;
        if !status.success() {
            failed.push(id);
        }
    }

    if scratch {
        if let Err(e) = std::fs::remove_file(&ledger) {
            debug!(error = %e, "Could not remove scratch ledger");
        }
    }
    if !failed.is_empty() {
        bail!("workers {:?} exited with an error", failed);
    }

    info!(
        admissions = args.workers * args.calls,
        elapsed_ms = started.elapsed().as_millis() as u64,
        limit,
        "Run complete"
    );
    Ok(())
}

async fn worker(mut config: KronosConfig, args: &WorkerArgs) -> anyhow::Result<()> {
    args.limits.apply(&mut config.limiter);
    if config.limiter.ledger_path.is_none() {
        bail!("worker processes need a shared --ledger file");
    }

    let limiter = Arc::new(config.limiter.build(Arc::new(TracingLogger))?);
    for seq in 0..args.calls {
        let at = Arc::clone(&limiter).acquire_async().await?;
        report(args.id, seq, at)?;
    }
    Ok(())
}

/// Print one admission, stamped with the instant the ledger recorded, as a
/// JSON line on stdout.
fn report(worker: usize, seq: usize, at: Duration) -> anyhow::Result<()> {
    let admitted_at = i64::try_from(at.as_secs())
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, at.subsec_nanos()))
        .context("admission time out of range")?;

    let record = serde_json::json!({
        "worker": worker,
        "seq": seq,
        "admitted_at": admitted_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    });
    println!("{}", record);
    Ok(())
}
