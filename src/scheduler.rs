//! Periodic cycle driver.
//!
//! Runs one monitoring cycle per interval tick. Cycles never overlap: a
//! tick that fires while the previous cycle is still running is skipped
//! and counted as an overrun, never queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::Target;
use crate::coordinator::{run_cycle, CycleContext};

/// Drives cycles on a fixed interval until shutdown.
pub struct Scheduler {
    targets: Arc<Vec<Target>>,
    ctx: CycleContext,
    interval: Duration,
    overruns: AtomicU64,
}

impl Scheduler {
    pub fn new(targets: Vec<Target>, ctx: CycleContext, interval: Duration) -> Self {
        Self {
            targets: Arc::new(targets),
            ctx,
            interval,
            overruns: AtomicU64::new(0),
        }
    }

    /// Ticks skipped because the previous cycle was still running.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Run cycles until `shutdown` fires. The first cycle starts
    /// immediately. An in-flight cycle is drained before this returns, so
    /// results computed before shutdown still reach the collector.
    pub async fn run(&self, shutdown: broadcast::Sender<()>) {
        // One permit: a busy gate means the previous cycle is still running
        let gate = Arc::new(Semaphore::new(1));
        let mut shutdown_rx = shutdown.subscribe();
        let mut cycles: JoinSet<crate::coordinator::CycleReport> = JoinSet::new();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Scheduler started: {} targets every {:?}",
            self.targets.len(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                    match finished {
                        Ok(report) if report.degraded() => {
                            tracing::warn!(
                                "Cycle degraded: {} metric pushes failed",
                                report.pushes_failed
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Cycle task failed: {}", e),
                    }
                }
                _ = ticker.tick() => {
                    let permit = match gate.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.overruns.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                "Cycle overrun: previous cycle still running, skipping this tick"
                            );
                            continue;
                        }
                    };

                    let targets = self.targets.clone();
                    let ctx = self.ctx.clone();
                    let cancel = shutdown.subscribe();

                    cycles.spawn(async move {
                        let _permit = permit;
                        run_cycle(targets, ctx, cancel).await
                    });
                }
            }
        }

        // Best-effort drain of whatever cycle is still in flight; its own
        // cancel receiver has already fired.
        while let Some(finished) = cycles.join_next().await {
            if let Ok(report) = finished {
                if report.degraded() {
                    tracing::warn!(
                        "Final cycle degraded: {} metric pushes failed",
                        report.pushes_failed
                    );
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeError, ProbeOptions, ProbeSample, Prober};
    use crate::sink::{MetricsSink, RetryPolicy, SinkError};

    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    /// Fixed-delay prober that tracks how many probes overlap.
    struct OverlapTrackingProber {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl OverlapTrackingProber {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for OverlapTrackingProber {
        async fn send_probes(
            &self,
            _address: &str,
            count: u32,
            _timeout: Duration,
        ) -> Result<Vec<ProbeSample>, ProbeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok((0..count)
                .map(|_| ProbeSample {
                    sent_at: Utc::now(),
                    rtt: Some(Duration::from_millis(1)),
                    delivered: true,
                })
                .collect())
        }
    }

    struct NullSink;

    #[async_trait]
    impl MetricsSink for NullSink {
        async fn push(&self, _: &str, _: &str, _: f64) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn target() -> Target {
        Target {
            id: "home/isp".to_string(),
            address: "203.0.113.1".to_string(),
            location: "home".to_string(),
            isp_name: "ISP".to_string(),
            connection_type: "fiber".to_string(),
            sink_hostname: "gw-home".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_cycle_skips_tick_without_overlap() {
        // Each cycle takes ~150ms against a 100ms interval: every other
        // tick lands while the previous cycle is still running.
        let prober = Arc::new(OverlapTrackingProber::new(Duration::from_millis(150)));
        let ctx = CycleContext {
            prober: prober.clone(),
            sink: Arc::new(NullSink),
            probe_opts: ProbeOptions {
                count: 1,
                per_probe_timeout: Duration::from_secs(3),
                deadline: Duration::from_secs(3600),
            },
            retry: RetryPolicy::default(),
            max_in_flight: 1,
            drain_grace: Duration::from_secs(1),
        };

        let scheduler = Arc::new(Scheduler::new(
            vec![target()],
            ctx,
            Duration::from_millis(100),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let runner = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        // Ticks land at 0ms (cycle 1, busy until ~150ms), 100ms (skipped),
        // 200ms (cycle 2). Stop shortly after the second cycle starts.
        tokio::time::sleep(Duration::from_millis(220)).await;
        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();

        assert_eq!(scheduler.overruns(), 1);
        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_cycles_never_overrun() {
        let prober = Arc::new(OverlapTrackingProber::new(Duration::from_millis(10)));
        let ctx = CycleContext {
            prober: prober.clone(),
            sink: Arc::new(NullSink),
            probe_opts: ProbeOptions {
                count: 1,
                per_probe_timeout: Duration::from_secs(3),
                deadline: Duration::from_secs(3600),
            },
            retry: RetryPolicy::default(),
            max_in_flight: 1,
            drain_grace: Duration::from_secs(1),
        };

        let scheduler = Arc::new(Scheduler::new(
            vec![target()],
            ctx,
            Duration::from_millis(100),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let runner = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(450)).await;
        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();

        assert_eq!(scheduler.overruns(), 0);
    }
}
