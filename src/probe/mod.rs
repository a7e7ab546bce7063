//! Probe capability and the per-target probe driver.

mod ping;

pub use ping::PingProber;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::Target;
use crate::stats::{self, ProbeResult};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Outcome of a single echo request.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    pub sent_at: DateTime<Utc>,
    /// Round-trip time. Absent when the echo was lost, or when a reply
    /// arrived but no timing could be derived from it.
    pub rtt: Option<Duration>,
    pub delivered: bool,
}

/// An injectable reachability-probe capability.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send `count` probes to `address`, each bounded by `timeout`.
    ///
    /// Lost probes come back as undelivered samples, not errors; an `Err`
    /// means the attempt could not be carried out at all.
    async fn send_probes(
        &self,
        address: &str,
        count: u32,
        timeout: Duration,
    ) -> Result<Vec<ProbeSample>, ProbeError>;
}

/// Probe timing knobs, shared by every target in a cycle.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    /// Echo requests per probe
    pub count: u32,
    /// Timeout for one echo request
    pub per_probe_timeout: Duration,
    /// Hard deadline for the whole operation
    pub deadline: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            count: 5,
            per_probe_timeout: Duration::from_secs(3),
            deadline: Duration::from_secs(30),
        }
    }
}

/// Probe one target and reduce its samples to a result.
///
/// Unreachability is data: a blown deadline or a transport error comes back
/// as a result with 100% loss, never as an `Err`. The only error path is a
/// zero probe count, which is a caller bug rather than a network condition.
pub async fn probe(
    prober: &dyn Prober,
    target: &Target,
    opts: ProbeOptions,
) -> Result<ProbeResult, ProbeError> {
    if opts.count == 0 {
        return Err(ProbeError::Config(format!(
            "probe count for {} is zero",
            target.id
        )));
    }

    let attempt = tokio::time::timeout(
        opts.deadline,
        prober.send_probes(&target.address, opts.count, opts.per_probe_timeout),
    )
    .await;

    match attempt {
        Ok(Ok(samples)) => stats::aggregate(&target.id, &samples),
        Ok(Err(e)) => {
            tracing::warn!("Probe failed for {} ({}): {}", target.id, target.address, e);
            Ok(ProbeResult::unreachable(&target.id))
        }
        Err(_) => {
            tracing::warn!(
                "Probe deadline {:?} exceeded for {} ({})",
                opts.deadline,
                target.id,
                target.address
            );
            Ok(ProbeResult::unreachable(&target.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(address: &str) -> Target {
        Target {
            id: "loc/isp".to_string(),
            address: address.to_string(),
            location: "loc".to_string(),
            isp_name: "ISP".to_string(),
            connection_type: "fiber".to_string(),
            sink_hostname: "gw-loc".to_string(),
        }
    }

    struct FixedProber {
        rtt_ms: f64,
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn send_probes(
            &self,
            _address: &str,
            count: u32,
            _timeout: Duration,
        ) -> Result<Vec<ProbeSample>, ProbeError> {
            Ok((0..count)
                .map(|_| ProbeSample {
                    sent_at: Utc::now(),
                    rtt: Some(Duration::from_secs_f64(self.rtt_ms / 1000.0)),
                    delivered: true,
                })
                .collect())
        }
    }

    struct FailingProber;

    #[async_trait]
    impl Prober for FailingProber {
        async fn send_probes(
            &self,
            _address: &str,
            _count: u32,
            _timeout: Duration,
        ) -> Result<Vec<ProbeSample>, ProbeError> {
            Err(ProbeError::Network("host unreachable".to_string()))
        }
    }

    struct StuckProber;

    #[async_trait]
    impl Prober for StuckProber {
        async fn send_probes(
            &self,
            _address: &str,
            _count: u32,
            _timeout: Duration,
        ) -> Result<Vec<ProbeSample>, ProbeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_probe_aggregates_samples() {
        let result = probe(&FixedProber { rtt_ms: 2.5 }, &target("203.0.113.1"), ProbeOptions::default())
            .await
            .unwrap();

        assert!(result.reachable);
        assert_eq!(result.packet_loss, 0.0);
        assert!((result.avg_ms - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_transport_error_is_unreachable_data() {
        let result = probe(&FailingProber, &target("203.0.113.1"), ProbeOptions::default())
            .await
            .unwrap();

        assert!(!result.reachable);
        assert_eq!(result.packet_loss, 100.0);
        assert_eq!(result.avg_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_deadline_is_unreachable_data() {
        let opts = ProbeOptions {
            deadline: Duration::from_secs(30),
            ..ProbeOptions::default()
        };
        let result = probe(&StuckProber, &target("203.0.113.1"), opts).await.unwrap();

        assert!(!result.reachable);
        assert_eq!(result.packet_loss, 100.0);
    }

    #[tokio::test]
    async fn test_probe_zero_count_is_an_error() {
        let opts = ProbeOptions {
            count: 0,
            ..ProbeOptions::default()
        };
        let err = probe(&FixedProber { rtt_ms: 1.0 }, &target("203.0.113.1"), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }
}
