//! Cycle coordination: concurrent probe dispatch, metric push, report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::config::Target;
use crate::probe::{self, ProbeOptions, Prober};
use crate::sink::{self, MetricsSink, RetryPolicy};
use crate::stats::ProbeResult;

/// Summary of one monitoring pass. Built fresh each cycle and produced on
/// every path, including cancellation and partial failure.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub targets_attempted: usize,
    pub unreachable: usize,
    pub pushes_succeeded: usize,
    pub pushes_failed: usize,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            targets_attempted: 0,
            unreachable: 0,
            pushes_succeeded: 0,
            pushes_failed: 0,
        }
    }

    /// A cycle with any failed pushes is degraded, never fatal.
    pub fn degraded(&self) -> bool {
        self.pushes_failed > 0
    }
}

/// Everything a cycle needs besides the target list.
#[derive(Clone)]
pub struct CycleContext {
    pub prober: Arc<dyn Prober>,
    pub sink: Arc<dyn MetricsSink>,
    pub probe_opts: ProbeOptions,
    pub retry: RetryPolicy,
    /// Concurrent probe cap for the cycle
    pub max_in_flight: usize,
    /// How long to keep collecting in-flight results after a cancel
    pub drain_grace: Duration,
}

/// Run one monitoring cycle over the full target list.
///
/// Probes run concurrently under the in-flight cap; each result is pushed
/// as it arrives and tallied into the report. A cancel on `cancel` stops
/// new probes from starting and drains already-running ones for up to
/// `drain_grace` - results computed before the grace runs out still get
/// pushed.
pub async fn run_cycle(
    targets: Arc<Vec<Target>>,
    ctx: CycleContext,
    mut cancel: broadcast::Receiver<()>,
) -> CycleReport {
    let started_at = Utc::now();
    let mut report = CycleReport::new(started_at);

    tracing::debug!(
        "Cycle starting: {} targets, {} max in flight",
        targets.len(),
        ctx.max_in_flight
    );

    let limit = Arc::new(Semaphore::new(ctx.max_in_flight.max(1)));
    let (tx, mut rx) = mpsc::channel::<(Target, ProbeResult)>(targets.len().max(1));

    let mut probes = JoinSet::new();
    for target in targets.iter().cloned() {
        let limit = limit.clone();
        let tx = tx.clone();
        let prober = ctx.prober.clone();
        let opts = ctx.probe_opts;

        probes.spawn(async move {
            // A closed semaphore means the cycle was cancelled before this
            // probe got a slot.
            let _permit = match limit.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            match probe::probe(prober.as_ref(), &target, opts).await {
                Ok(result) => {
                    let _ = tx.send((target, result)).await;
                }
                Err(e) => {
                    tracing::error!("Probe contract violation for {}: {}", target.id, e);
                }
            }
        });
    }
    drop(tx);

    // Results are consumed until every sender is gone or a cancel arrives.
    let mut cancelled = false;
    let mut cancel_armed = true;

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some((target, result)) => {
                        push_and_tally(&ctx, &mut report, &target, &result).await;
                    }
                    None => break,
                }
            }
            signal = cancel.recv(), if cancel_armed => {
                match signal {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        tracing::info!("Cycle cancelled, draining in-flight probes");
                        limit.close();
                        cancelled = true;
                        break;
                    }
                    // Sender gone: nothing can cancel this cycle anymore
                    Err(RecvError::Closed) => cancel_armed = false,
                }
            }
        }
    }

    if cancelled {
        loop {
            match tokio::time::timeout(ctx.drain_grace, rx.recv()).await {
                Ok(Some((target, result))) => {
                    push_and_tally(&ctx, &mut report, &target, &result).await;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Drain grace of {:?} elapsed, abandoning remaining probes",
                        ctx.drain_grace
                    );
                    break;
                }
            }
        }
    }

    probes.abort_all();

    tracing::info!(
        "Cycle complete: {} targets attempted, {} unreachable, {} pushes ok, {} failed",
        report.targets_attempted,
        report.unreachable,
        report.pushes_succeeded,
        report.pushes_failed
    );

    report
}

/// Push one result's metrics and fold the outcome into the report.
async fn push_and_tally(
    ctx: &CycleContext,
    report: &mut CycleReport,
    target: &Target,
    result: &ProbeResult,
) {
    report.targets_attempted += 1;
    if !result.reachable {
        report.unreachable += 1;
    }

    let outcome = sink::push_result(ctx.sink.as_ref(), &target.sink_hostname, result, ctx.retry).await;
    report.pushes_succeeded += outcome.succeeded;
    report.pushes_failed += outcome.failed;

    let status = if result.packet_loss < 100.0 { "OK" } else { "FAILED" };
    tracing::info!(
        "{} - {} ({} via {}): loss {:.1}%, avg rtt {:.3} ms",
        status,
        target.id,
        target.isp_name,
        target.connection_type,
        result.packet_loss,
        result.avg_ms
    );
}
