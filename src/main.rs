use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use ratequeue::config::SchedulerConfig;
use ratequeue::ratelimit::{error_handler, LimiterRegistry};

/// Push a batch of tasks through the default and group limiters.
#[derive(Parser, Debug)]
#[command(name = "ratequeue", version, about)]
struct Args {
    /// YAML file with limiter settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of tasks routed to the default limiter
    #[arg(long, default_value_t = 60)]
    tasks: usize,

    /// Number of tasks routed to the group limiter
    #[arg(long, default_value_t = 5)]
    group_tasks: usize,

    /// Override the default limiter's burst limit
    #[arg(long)]
    burst: Option<u32>,

    /// Override the default limiter's window in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

/// How long runtime shutdown waits for blocked waiter threads.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    block_on_with_grace(run(args), SHUTDOWN_GRACE)?
}

/// Drive `future` on a fresh runtime, then give blocking tasks still running
/// at most `grace` before abandoning them.
fn block_on_with_grace<F>(future: F, grace: Duration) -> std::io::Result<F::Output>
where
    F: std::future::Future,
{
    let runtime = tokio::runtime::Runtime::new()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!("Starting ratequeue");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(burst) = args.burst {
        config.default_limiter.burst_limit = burst;
    }
    if let Some(window_ms) = args.window_ms {
        config.default_limiter.window_ms = window_ms;
    }
    config.validate()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let failures = Arc::new(AtomicUsize::new(0));
    let failure_count = failures.clone();
    let registry = Arc::new(LimiterRegistry::with_error_handler(
        &config,
        error_handler(move |err| {
            failure_count.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "Task failed");
        }),
    )?);
    if !registry.is_running() {
        registry.start()?;
    }
    info!(limiters = ?registry.names(), "Limiters running");

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.tasks + args.group_tasks);
    for (name, count) in [
        (LimiterRegistry::DEFAULT_LIMITER, args.tasks),
        (LimiterRegistry::GROUP_LIMITER, args.group_tasks),
    ] {
        for seq in 0..count {
            let handle = registry.route(name, move || {
                debug!(limiter = %name, seq, "Processing task");
                Ok(seq)
            })?;
            handles.push(handle);
        }
    }

    let waiters = handles
        .into_iter()
        .map(|handle| tokio::task::spawn_blocking(move || handle.wait()));
    let drained = futures::future::join_all(waiters);

    tokio::select! {
        results = drained => {
            let completed = results
                .iter()
                .filter(|result| matches!(result, Ok(Ok(_))))
                .count();
            info!(
                completed,
                failed = failures.load(Ordering::Relaxed),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "All tasks drained"
            );
        }
        _ = shutdown_signal() => {
            info!("Shutdown requested before all tasks drained");
        }
    }

    let stopping = registry.clone();
    tokio::task::spawn_blocking(move || stopping.stop(Some(Duration::from_secs(5)))).await?;

    info!("Ratequeue stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_waiter_does_not_hold_shutdown() {
        let (_sender, receiver) = std::sync::mpsc::channel::<()>();
        let started = Instant::now();

        let output = block_on_with_grace(
            async move {
                // Never released, like a waiter on a task that was never run
                drop(tokio::task::spawn_blocking(move || receiver.recv().is_ok()));
                7
            },
            Duration::from_millis(50),
        )
        .unwrap();

        assert_eq!(output, 7);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
