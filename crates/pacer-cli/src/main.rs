use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use eyre::{Result, WrapErr};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use pacer_core::impls::InMemoryMetrics;
use pacer_core::polling::PollingEventKind;
use pacer_core::task::TaskOutput;
use pacer_core::{HandlerRegistry, Scheduler, SchedulerOptions, TaskError, TaskHandler};

/// Run a polling configuration against a set of demo handlers.
#[derive(Debug, Parser)]
#[command(name = "pacer", version, about)]
struct Args {
    /// Polling configuration (JSON, `{ "resources": { ... } }`).
    #[arg(short, long)]
    config: PathBuf,

    /// Scheduler options (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    options: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for: Option<u64>,

    /// Print the final status as JSON.
    #[arg(long)]
    json: bool,
}

/// Fails every `every`-th call.
struct FlakyHandler {
    calls: AtomicU32,
    every: u32,
}

impl FlakyHandler {
    fn new(every: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            every: every.max(1),
        }
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, args: Vec<Value>) -> TaskOutput {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if call % self.every == 0 {
            return Err(TaskError::execution(format!("intentional failure (call={call})")));
        }
        Ok(json!({ "call": call, "args": args }))
    }
}

fn registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("ok", |_args: Vec<Value>| async { Ok::<_, TaskError>(Value::Bool(true)) })?;
    registry.register("echo", |args: Vec<Value>| async move { Ok::<_, TaskError>(Value::Array(args)) })?;
    registry.register("slow", |args: Vec<Value>| async move {
        let millis = args.first().and_then(Value::as_u64).unwrap_or(500);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok::<_, TaskError>(json!(millis))
    })?;
    registry.register("fail", |_args: Vec<Value>| async {
        Err::<Value, _>(TaskError::execution("this handler always fails"))
    })?;
    registry.register("flaky", FlakyHandler::new(3))?;
    Ok(registry)
}

fn read_options(path: Option<&PathBuf>) -> Result<SchedulerOptions> {
    let Some(path) = path else {
        return Ok(SchedulerOptions::default());
    };
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read options file {}", path.display()))?;
    serde_json::from_str(&raw).wrap_err("invalid scheduler options")
}

async fn shutdown_signal(run_for: Option<u64>) {
    match run_for {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .wrap_err_with(|| format!("failed to read config file {}", args.config.display()))?;
    let config = pacer_core::SchedulerConfig::from_json(&raw)?;
    let options = read_options(args.options.as_ref())?;

    let metrics = Arc::new(InMemoryMetrics::new());
    let scheduler = Scheduler::with_metrics(config, registry()?, options, metrics.clone())?;
    let mut events = scheduler.subscribe();

    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event.kind {
                    PollingEventKind::EndCycle { stats } => info!(
                        resource = %event.resource,
                        group = %event.group,
                        cycle = stats.cycles,
                        duration_ms = stats.last_cycle_duration_ms,
                        fast = stats.in_fast_cycle_tasks,
                        slow = stats.in_slow_cycle_tasks,
                        off = stats.in_off_cycle_tasks,
                        "cycle"
                    ),
                    PollingEventKind::Error { id, message } => {
                        warn!(resource = %event.resource, task = %id, "{message}")
                    }
                    _ => info!(resource = %event.resource, group = %event.group, kind = ?event.kind, "polling"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event reporter lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    scheduler.start();
    shutdown_signal(args.run_for).await;
    scheduler.stop().await;
    reporter.abort();

    let status = scheduler.status();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for group in &status.groups {
            println!(
                "{}/{}: cycles={} overruns={} avg={:.1}ms fast={} slow={} off={}",
                group.resource,
                group.group,
                group.stats.cycles,
                group.stats.overruns,
                group.stats.average_cycle_duration_ms,
                group.stats.in_fast_cycle_tasks,
                group.stats.in_slow_cycle_tasks,
                group.stats.in_off_cycle_tasks,
            );
        }
        for (key, value) in metrics.render() {
            println!("{key} {value}");
        }
    }
    Ok(())
}
