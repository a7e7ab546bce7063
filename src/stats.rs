//! Reduction of raw probe samples into per-target statistics.

use crate::probe::{ProbeError, ProbeSample};

/// Aggregated statistics for one target in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub target_id: String,
    /// Packet loss percentage, 0 through 100.
    pub packet_loss: f64,
    /// Round-trip times in milliseconds. Zero when no timing data exists
    /// (full loss, or delivered replies that carried no usable time).
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub reachable: bool,
}

impl ProbeResult {
    /// Result for a target that delivered nothing.
    pub fn unreachable(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            packet_loss: 100.0,
            min_ms: 0.0,
            avg_ms: 0.0,
            max_ms: 0.0,
            reachable: false,
        }
    }
}

/// Reduce a sample sequence to a `ProbeResult`.
///
/// Loss is exact float division over the full sample count. Times come only
/// from samples carrying a round-trip time, and the average is the
/// arithmetic mean of those, independent of anything the underlying probe
/// mechanism reports about itself. Delivered samples without a time keep
/// the target reachable but leave all three times at zero.
///
/// An empty sample sequence violates the prober contract and is an error.
pub fn aggregate(target_id: &str, samples: &[ProbeSample]) -> Result<ProbeResult, ProbeError> {
    let total = samples.len();
    if total == 0 {
        return Err(ProbeError::Config(format!(
            "no samples produced for {}",
            target_id
        )));
    }

    let delivered = samples.iter().filter(|s| s.delivered).count();
    let packet_loss = 100.0 * (total - delivered) as f64 / total as f64;

    if delivered == 0 {
        return Ok(ProbeResult::unreachable(target_id));
    }

    let times: Vec<f64> = samples
        .iter()
        .filter(|s| s.delivered)
        .filter_map(|s| s.rtt)
        .map(|rtt| rtt.as_secs_f64() * 1000.0)
        .collect();

    if times.is_empty() {
        // Replies arrived but none carried a usable time. Loss is still
        // meaningful; the times stay at the zero sentinel.
        return Ok(ProbeResult {
            target_id: target_id.to_string(),
            packet_loss,
            min_ms: 0.0,
            avg_ms: 0.0,
            max_ms: 0.0,
            reachable: true,
        });
    }

    let min_ms = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg_ms = times.iter().sum::<f64>() / times.len() as f64;

    Ok(ProbeResult {
        target_id: target_id.to_string(),
        packet_loss,
        min_ms,
        avg_ms,
        max_ms,
        reachable: true,
    })
}
