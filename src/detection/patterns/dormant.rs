use std::collections::HashMap;

use crate::config::DormantConfig;
use crate::detection::{DetectionContext, Detector};
use crate::error::DetectorError;
use crate::graph::Direction;
use crate::types::{Outlier, OutlierDetails, OutlierType, Transaction};

use super::ratio;

/// Outgoing transfers from an address that had been silent for at least `dormancy_secs`.
pub struct DormantDetector {
    config: DormantConfig,
}

impl DormantDetector {
    pub fn new(config: DormantConfig) -> Self {
        Self { config }
    }

    fn check(&self, tx: &Transaction, history: &[Transaction]) -> Option<Outlier> {
        // History is oldest first; everything strictly before this transfer.
        let before: Vec<&Transaction> = history
            .iter()
            .filter(|h| h.timestamp < tx.timestamp && h.tx_hash != tx.tx_hash)
            .collect();
        let previous = before.last()?;

        let gap = tx.timestamp - previous.timestamp;
        let dormant_secs = gap.num_seconds();
        if dormant_secs < 0 || (dormant_secs as u64) < self.config.dormancy_secs {
            return None;
        }

        let historical_mean =
            before.iter().map(|h| h.amount_f64()).sum::<f64>() / before.len() as f64;
        let mut severity = self
            .config
            .bands
            .classify(ratio(dormant_secs as f64, self.config.dormancy_secs as f64));
        if historical_mean > 0.0
            && tx.amount_f64() >= self.config.amount_multiplier * historical_mean
        {
            severity = severity.escalate();
        }

        tracing::info!(
            address = %tx.from,
            tx_hash = %tx.tx_hash,
            dormant_days = dormant_secs / 86_400,
            severity = %severity,
            "Dormant account reactivated"
        );

        let details = OutlierDetails::Dormant {
            previous_activity: previous.timestamp,
            reactivated_at: tx.timestamp,
            dormant_secs,
            dormancy_threshold_secs: self.config.dormancy_secs,
            historical_mean,
            historical_count: before.len(),
        };
        Some(
            Outlier::new(OutlierType::PatternDormant, severity, tx.from.clone(), details)
                .for_transaction(tx),
        )
    }
}

impl Detector for DormantDetector {
    fn name(&self) -> &'static str {
        "dormant"
    }

    fn run(&self, ctx: &DetectionContext) -> Result<Vec<Outlier>, DetectorError> {
        let window = ctx.recent(self.config.window_secs)?;
        let mut histories: HashMap<&str, Vec<Transaction>> = HashMap::new();
        let mut outliers = Vec::new();

        for tx in &window {
            let history = histories
                .entry(tx.from.as_str())
                .or_insert_with(|| ctx.graph.get_address_transactions(&tx.from, Direction::Both));
            if let Some(outlier) = self.check(tx, history) {
                outliers.push(outlier);
            }
        }
        Ok(outliers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::patterns::testing::{context, graph_with, tx};
    use crate::types::Severity;

    const DAY: i64 = 86_400;

    fn detector() -> DormantDetector {
        DormantDetector::new(DormantConfig::default())
    }

    #[test]
    fn test_reactivation_after_dormancy() {
        let graph = graph_with(vec![
            tx("old", "A", "B", "100", 0),
            tx("back", "A", "C", "100", 45 * DAY),
        ]);
        let outliers = detector().run(&context(graph, 45 * DAY + 60)).unwrap();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].transaction_hash.as_deref(), Some("back"));
        assert_eq!(outliers[0].address, "A");
        // 45 days over a 30 day threshold is below the medium band.
        assert_eq!(outliers[0].severity, Severity::Low);
    }

    #[test]
    fn test_received_funds_count_as_activity() {
        let graph = graph_with(vec![
            tx("old", "A", "B", "100", 0),
            tx("topup", "Z", "A", "100", 40 * DAY),
            tx("spend", "A", "C", "100", 45 * DAY),
        ]);
        assert!(detector().run(&context(graph, 45 * DAY + 60)).unwrap().is_empty());
    }

    #[test]
    fn test_short_gap_is_ignored() {
        let graph = graph_with(vec![
            tx("old", "A", "B", "100", 0),
            tx("back", "A", "C", "100", 10 * DAY),
        ]);
        assert!(detector().run(&context(graph, 10 * DAY + 60)).unwrap().is_empty());
    }

    #[test]
    fn test_first_ever_transfer_is_not_dormant() {
        let graph = graph_with(vec![tx("first", "A", "B", "100", 0)]);
        assert!(detector().run(&context(graph, 60)).unwrap().is_empty());
    }

    #[test]
    fn test_large_reactivation_escalates() {
        let graph = graph_with(vec![
            tx("old1", "A", "B", "100", 0),
            tx("old2", "A", "B", "100", 60),
            tx("back", "A", "C", "5000", 130 * DAY),
        ]);
        let outliers = detector().run(&context(graph, 130 * DAY + 60)).unwrap();
        assert_eq!(outliers.len(), 1);
        // ~4.3x dormancy is high; 50x the historical mean lifts it to critical.
        assert_eq!(outliers[0].severity, Severity::Critical);
        match &outliers[0].details {
            OutlierDetails::Dormant { historical_count, historical_mean, .. } => {
                assert_eq!(*historical_count, 2);
                assert_eq!(*historical_mean, 100.0);
            }
            other => panic!("unexpected details {:?}", other),
        }
    }
}
