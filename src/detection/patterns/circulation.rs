use std::collections::BTreeSet;

use bigdecimal::{BigDecimal, ToPrimitive};

use crate::config::CirculationConfig;
use crate::detection::{DetectionContext, Detector};
use crate::error::DetectorError;
use crate::graph::Path;
use crate::types::{Outlier, OutlierDetails, OutlierType};

use super::ratio;

/// Funds that leave an address and come back to it through a chain of transfers.
pub struct CirculationDetector {
    config: CirculationConfig,
}

impl CirculationDetector {
    pub fn new(config: CirculationConfig) -> Self {
        Self { config }
    }

    fn qualifies(&self, path: &Path) -> bool {
        path.hops() >= self.config.min_hops
            && path.total_amount().to_f64().unwrap_or(0.0) >= self.config.min_amount
    }
}

impl Detector for CirculationDetector {
    fn name(&self) -> &'static str {
        "circulation"
    }

    fn run(&self, ctx: &DetectionContext) -> Result<Vec<Outlier>, DetectorError> {
        let start = ctx.lookback(self.config.window_secs);
        let senders: BTreeSet<String> = ctx
            .recent(self.config.window_secs)?
            .into_iter()
            .map(|tx| tx.from)
            .collect();

        let mut reported: BTreeSet<Vec<String>> = BTreeSet::new();
        let mut outliers = Vec::new();

        for origin in &senders {
            let paths =
                ctx.graph
                    .find_paths_in_range(origin, origin, self.config.max_depth, start, ctx.end)?;

            let Some(largest) = paths
                .into_iter()
                .filter(|p| self.qualifies(p))
                .max_by(|a, b| a.total_amount().cmp(&b.total_amount()))
            else {
                continue;
            };

            // The same ring is found again from each of its members.
            let mut ring = largest.tx_hashes();
            ring.sort();
            if !reported.insert(ring) {
                continue;
            }

            let total: BigDecimal = largest.total_amount();
            let severity = self
                .config
                .bands
                .classify(ratio(total.to_f64().unwrap_or(0.0), self.config.min_amount));
            tracing::info!(
                address = %origin,
                hops = largest.hops(),
                total = %total,
                severity = %severity,
                "Circulation pattern detected"
            );

            let details = OutlierDetails::Circulation {
                addresses: largest.addresses(),
                tx_hashes: largest.tx_hashes(),
                hops: largest.hops(),
                total_amount: total.clone(),
                min_amount: self.config.min_amount,
                window_secs: self.config.window_secs,
            };
            let mut outlier = Outlier::new(
                OutlierType::PatternCirculation,
                severity,
                origin.clone(),
                details,
            );
            outlier.amount = Some(total);
            outliers.push(outlier);
        }

        Ok(outliers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::patterns::testing::{context, graph_with, tx};
    use crate::types::Severity;

    fn detector() -> CirculationDetector {
        CirculationDetector::new(CirculationConfig::default())
    }

    #[test]
    fn test_detects_three_hop_ring_once() {
        let graph = graph_with(vec![
            tx("ab", "A", "B", "20000", 10),
            tx("bc", "B", "C", "20000", 20),
            tx("ca", "C", "A", "20000", 30),
        ]);
        let outliers = detector().run(&context(graph, 100)).unwrap();
        assert_eq!(outliers.len(), 1);

        let outlier = &outliers[0];
        assert_eq!(outlier.outlier_type, OutlierType::PatternCirculation);
        assert_eq!(outlier.address, "A");
        assert!(outlier.transaction_hash.is_none());
        // 60000 / 10000 = 6 against bands 2/5/10.
        assert_eq!(outlier.severity, Severity::High);
        match &outlier.details {
            OutlierDetails::Circulation { addresses, hops, .. } => {
                assert_eq!(addresses, &vec!["A", "B", "C", "A"]);
                assert_eq!(*hops, 3);
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_small_rings_are_ignored() {
        let graph = graph_with(vec![
            tx("ab", "A", "B", "10", 10),
            tx("ba", "B", "A", "10", 20),
        ]);
        assert!(detector().run(&context(graph, 100)).unwrap().is_empty());
    }

    #[test]
    fn test_rings_must_move_forward_in_time() {
        let graph = graph_with(vec![
            tx("ab", "A", "B", "20000", 30),
            tx("bc", "B", "C", "20000", 20),
            tx("ca", "C", "A", "20000", 10),
        ]);
        // Every hop predates the one before it, so no origin has a time-ordered return.
        assert!(detector().run(&context(graph, 100)).unwrap().is_empty());
    }

    #[test]
    fn test_self_transfer_is_not_a_ring() {
        let graph = graph_with(vec![tx("aa", "A", "A", "50000", 10)]);
        assert!(detector().run(&context(graph, 100)).unwrap().is_empty());
    }
}
