//! gatewatch - concurrent gateway reachability monitor.
//!
//! Probes a fleet of ISP gateways with ICMP echo requests and pushes loss
//! and round-trip statistics to a Zabbix trapper endpoint, either once or
//! on a fixed cycle.

mod config;
mod coordinator;
mod probe;
mod scheduler;
mod sink;
mod stats;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::MonitorConfig;
use coordinator::{run_cycle, CycleContext};
use probe::{PingProber, ProbeOptions};
use scheduler::Scheduler;
use sink::{RetryPolicy, ZabbixSink};

/// How long a cancelled cycle keeps collecting in-flight results.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "gatewatch", about = "Concurrent gateway reachability monitor")]
struct Args {
    /// Path to the fleet configuration file
    #[arg(long, default_value = "config.yml")]
    config: String,

    /// Run a single monitoring cycle and exit
    #[arg(long)]
    once: bool,

    /// Override the cycle interval in seconds
    #[arg(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatewatch=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let cfg = MonitorConfig::load();
    tracing::info!(
        "Starting gatewatch - collector at {}:{}",
        cfg.zabbix_server,
        cfg.zabbix_port
    );

    // A broken or empty fleet document aborts here, before any probing
    let targets = config::load_targets(&args.config)?;
    tracing::info!("Loaded {} targets from {}", targets.len(), args.config);

    let ctx = CycleContext {
        prober: Arc::new(PingProber::new()),
        sink: Arc::new(ZabbixSink::new(&cfg.zabbix_server, cfg.zabbix_port)),
        probe_opts: ProbeOptions {
            count: cfg.probe_count,
            per_probe_timeout: cfg.per_probe_timeout,
            deadline: cfg.probe_deadline,
        },
        retry: RetryPolicy {
            retries: cfg.sink_retries,
            ..RetryPolicy::default()
        },
        max_in_flight: cfg.in_flight_cap(targets.len()),
        drain_grace: DRAIN_GRACE,
    };

    // Ctrl-C cancels the in-flight cycle; already-computed results still
    // get pushed before exit. The spawned task also keeps the channel open
    // for single-shot runs.
    let (shutdown_tx, _) = broadcast::channel(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(());
            }
        });
    }

    if args.once {
        let report = run_cycle(Arc::new(targets), ctx, shutdown_tx.subscribe()).await;
        if report.degraded() {
            tracing::warn!(
                "Some metrics failed to push ({} failures)",
                report.pushes_failed
            );
            std::process::exit(1);
        }
        return Ok(());
    }

    let interval = args.interval.map(Duration::from_secs).unwrap_or(cfg.cycle_interval);
    let scheduler = Scheduler::new(targets, ctx, interval);
    scheduler.run(shutdown_tx).await;

    Ok(())
}
