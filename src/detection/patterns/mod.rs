//! Structural detectors over the temporal graph.
//!
//! Each detector sweeps the addresses active in its own lookback window ending at the
//! run's reference time. None of them mutate the graph.

pub mod circulation;
pub mod dormant;
pub mod fan;
pub mod velocity;

use std::sync::Arc;

use crate::config::PatternConfig;

use super::Detector;

pub use circulation::CirculationDetector;
pub use dormant::DormantDetector;
pub use fan::{FanDetector, FanDirection};
pub use velocity::VelocityDetector;

/// The enabled pattern detectors for a configuration.
pub fn build(config: &PatternConfig) -> Vec<Arc<dyn Detector>> {
    let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();
    if !config.enabled {
        return detectors;
    }
    if config.circulation.enabled {
        detectors.push(Arc::new(CirculationDetector::new(config.circulation.clone())));
    }
    if config.fan_out.enabled {
        detectors.push(Arc::new(FanDetector::new(
            FanDirection::Out,
            config.fan_out.clone(),
        )));
    }
    if config.fan_in.enabled {
        detectors.push(Arc::new(FanDetector::new(
            FanDirection::In,
            config.fan_in.clone(),
        )));
    }
    if config.dormant.enabled {
        detectors.push(Arc::new(DormantDetector::new(config.dormant.clone())));
    }
    if config.velocity.enabled {
        detectors.push(Arc::new(VelocityDetector::new(config.velocity.clone())));
    }
    detectors
}

/// `observed / threshold`, with a zero threshold treated as unbounded.
pub(crate) fn ratio(observed: f64, threshold: f64) -> f64 {
    if threshold > 0.0 {
        observed / threshold
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::str::FromStr;
    use std::sync::Arc;

    use bigdecimal::BigDecimal;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::config::GraphConfig;
    use crate::detection::DetectionContext;
    use crate::graph::TemporalGraph;
    use crate::types::Transaction;

    pub fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    pub fn tx(hash: &str, from: &str, to: &str, amount: &str, offset_secs: i64) -> Transaction {
        Transaction {
            tx_hash: hash.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            amount: BigDecimal::from_str(amount).unwrap(),
            timestamp: epoch() + Duration::seconds(offset_secs),
            block_number: offset_secs.max(0) as u64,
            contract: String::new(),
            confirmed: true,
        }
    }

    pub fn graph_with(txs: Vec<Transaction>) -> Arc<TemporalGraph> {
        let graph = Arc::new(TemporalGraph::new(GraphConfig::default()));
        for t in txs {
            graph.add_transaction(t).unwrap();
        }
        graph
    }

    /// A context whose run window is the last day before `epoch() + end_offset`.
    pub fn context(graph: Arc<TemporalGraph>, end_offset: i64) -> DetectionContext {
        DetectionContext::load(graph, epoch() + Duration::seconds(end_offset), 86_400, 10_000)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_honours_enable_flags() {
        let mut config = PatternConfig::default();
        assert_eq!(build(&config).len(), 5);

        config.fan_in.enabled = false;
        let names: Vec<_> = build(&config).iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["circulation", "fan_out", "dormant", "velocity"]);

        config.enabled = false;
        assert!(build(&config).is_empty());
    }

    #[test]
    fn test_ratio_handles_zero_threshold() {
        assert_eq!(ratio(10.0, 5.0), 2.0);
        assert!(ratio(1.0, 0.0).is_infinite());
    }
}
