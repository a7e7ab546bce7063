//! Metrics sink capability, retry policy, and per-result metric fan-out.

mod zabbix;

pub use zabbix::ZabbixSink;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::stats::ProbeResult;

/// Sink error types.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Connection-level trouble; worth retrying.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// The collector rejected the item; retrying cannot help.
    #[error("permanent sink error: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// An injectable metrics-push capability.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Push one value for `hostname` under `key`.
    async fn push(&self, hostname: &str, key: &str, value: f64) -> Result<(), SinkError>;
}

/// Retry knobs for transient push failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub retries: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Push one value, retrying transient failures per policy.
/// Permanent failures are returned immediately.
pub async fn push_with_retry(
    sink: &dyn MetricsSink,
    hostname: &str,
    key: &str,
    value: f64,
    policy: RetryPolicy,
) -> Result<(), SinkError> {
    let mut attempt: u32 = 0;

    loop {
        match sink.push(hostname, key, value).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < policy.retries => {
                attempt += 1;
                tracing::warn!(
                    "Push of {} for {} failed, retrying (attempt {} of {}): {}",
                    key,
                    hostname,
                    attempt + 1,
                    policy.retries + 1,
                    e
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Metric keys pushed for every probe result, values in percent and
/// milliseconds.
fn result_metrics(result: &ProbeResult) -> [(&'static str, f64); 4] {
    [
        ("ping.loss", result.packet_loss),
        ("ping.min", result.min_ms),
        ("ping.avg", result.avg_ms),
        ("ping.max", result.max_ms),
    ]
}

/// Per-key outcome tally for one result's metric set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PushOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Push all metrics of one result.
///
/// A failed key is logged and counted; the remaining keys are still
/// attempted, so partial success is an ordinary outcome.
pub async fn push_result(
    sink: &dyn MetricsSink,
    hostname: &str,
    result: &ProbeResult,
    policy: RetryPolicy,
) -> PushOutcome {
    let mut outcome = PushOutcome::default();

    for (key, value) in result_metrics(result) {
        match push_with_retry(sink, hostname, key, value, policy).await {
            Ok(()) => {
                outcome.succeeded += 1;
                tracing::debug!("Pushed {}={} for {}", key, value, hostname);
            }
            Err(e) => {
                outcome.failed += 1;
                tracing::error!("Failed to push {}={} for {}: {}", key, value, hostname, e);
            }
        }
    }

    outcome
}
