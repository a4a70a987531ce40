//! Observability Demo Service
//!
//! Runs a periodic unit of work under the full observability stack so the
//! wiring can be exercised end to end.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  work loop ──▶ Instrumented ──▶ registry ──▶ /metrics    │
//! │      ▲                                       /healthz    │
//! │      └── TerminationCoordinator ◀── SIGINT / SIGTERM     │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use prometheus::HistogramVec;
use tracing::{error, info};

use svc_observability::metrics::DURATION_BUCKETS;
use svc_observability::shutdown::DEFAULT_POLL_INTERVAL;
use svc_observability::{
    init_logging, Error, LoggingConfig, RegistryCache, RegistryOptions,
    TerminationCoordinator,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Observability demo - instrumented periodic worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service name used for metrics, logs and the log file
    #[arg(long, env = "SERVICE_NAME", default_value = "demo-worker")]
    service_name: String,

    /// Metrics port (probes upward when taken)
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Metrics server bind host
    #[arg(long, env = "METRICS_HOST", default_value = "0.0.0.0")]
    metrics_host: String,

    /// Log directory (defaults to <project root>/logs)
    #[arg(long, env = "LOGS_DIR")]
    logs_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds between units of work
    #[arg(long, env = "WORK_INTERVAL_SECONDS", default_value = "5")]
    work_interval_seconds: u64,

    /// Grace period after a shutdown signal, in milliseconds
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value = "2000")]
    shutdown_grace_ms: u64,

    /// Fail every Nth unit of work (0 disables)
    #[arg(long, env = "FAIL_EVERY", default_value = "0")]
    fail_every: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_file = init_logging(&LoggingConfig {
        service_name: args.service_name.clone(),
        logs_dir: args.logs_dir.clone(),
        log_level: Some(args.log_level.clone()),
        console: true,
        rotation_size: None,
    })?;

    info!("Starting {}", args.service_name);
    info!("  Log file: {}", log_file.display());
    info!("  Work interval: {}s", args.work_interval_seconds);
    info!("  Shutdown grace: {}ms", args.shutdown_grace_ms);

    let cache = Arc::new(RegistryCache::new());
    let mut options = RegistryOptions::default().with_bind_host(args.metrics_host.clone());
    if let Some(port) = args.metrics_port {
        options = options.with_port(port);
    }
    let registry = cache.setup(&args.service_name, options, true)?;

    if let Some(port) = registry.port() {
        info!("Metrics available at http://{}:{}/metrics", args.metrics_host, port);
    }

    let coordinator = Arc::new(TerminationCoordinator::with_grace_period(
        Duration::from_millis(args.shutdown_grace_ms),
    ));
    let signals = coordinator.install_signal_handlers()?;

    let duration = registry.create_histogram(
        "work_duration_seconds",
        "Duration of one unit of work",
        &["outcome"],
        Some(DURATION_BUCKETS),
    )?;

    let wrapper = cache
        .instrument(&args.service_name, "work_success", "work_failure")
        .operation("work");
    let interval = Duration::from_secs(args.work_interval_seconds);
    let iteration = AtomicU64::new(0);

    while !coordinator.is_termination_requested() {
        let started = Instant::now();
        let outcome = wrapper
            .run_async(do_work(&iteration, args.fail_every))
            .await;
        observe(&duration, started, outcome.is_ok());

        if coordinator
            .wait_for_termination(interval, DEFAULT_POLL_INTERVAL)
            .await
        {
            break;
        }
    }

    info!("Termination requested, shutting down");
    let stopped = cache.shutdown_all();
    info!("Stopped {} metrics server(s)", stopped);
    signals.abort();

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Work
// =============================================================================

async fn do_work(iteration: &AtomicU64, fail_every: u64) -> svc_observability::Result<u64> {
    let n = iteration.fetch_add(1, Ordering::Relaxed) + 1;
    info!("Processing batch {}", n);

    tokio::time::sleep(Duration::from_millis(50)).await;

    if fail_every > 0 && n % fail_every == 0 {
        return Err(Error::Internal(format!("batch {} failed", n)));
    }
    Ok(n)
}

fn observe(histogram: &HistogramVec, started: Instant, ok: bool) {
    let outcome = if ok { "success" } else { "failure" };
    match histogram.get_metric_with_label_values(&[outcome]) {
        Ok(h) => h.observe(started.elapsed().as_secs_f64()),
        Err(e) => error!("Failed to observe work duration: {}", e),
    }
}
