use std::collections::{BTreeMap, BTreeSet};

use bigdecimal::BigDecimal;

use crate::config::FanConfig;
use crate::detection::{DetectionContext, Detector};
use crate::error::DetectorError;
use crate::types::{Outlier, OutlierDetails, OutlierType};

use super::ratio;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanDirection {
    /// One sender, many distinct recipients.
    Out,
    /// Many distinct senders, one recipient.
    In,
}

#[derive(Default)]
struct Fan<'a> {
    counterparties: BTreeSet<&'a str>,
    transactions: usize,
    total: BigDecimal,
}

pub struct FanDetector {
    direction: FanDirection,
    config: FanConfig,
}

impl FanDetector {
    pub fn new(direction: FanDirection, config: FanConfig) -> Self {
        Self { direction, config }
    }
}

impl Detector for FanDetector {
    fn name(&self) -> &'static str {
        match self.direction {
            FanDirection::Out => "fan_out",
            FanDirection::In => "fan_in",
        }
    }

    fn run(&self, ctx: &DetectionContext) -> Result<Vec<Outlier>, DetectorError> {
        let window = ctx.recent(self.config.window_secs)?;

        let mut fans: BTreeMap<&str, Fan> = BTreeMap::new();
        for tx in &window {
            let (hub, counterparty) = match self.direction {
                FanDirection::Out => (tx.from.as_str(), tx.to.as_str()),
                FanDirection::In => (tx.to.as_str(), tx.from.as_str()),
            };
            let fan = fans.entry(hub).or_default();
            fan.counterparties.insert(counterparty);
            fan.transactions += 1;
            fan.total += &tx.amount;
        }

        let mut outliers = Vec::new();
        for (hub, fan) in fans {
            let distinct = fan.counterparties.len();
            if distinct <= self.config.threshold {
                continue;
            }
            let severity = self
                .config
                .bands
                .classify(ratio(distinct as f64, self.config.threshold as f64));
            tracing::info!(
                address = %hub,
                distinct,
                threshold = self.config.threshold,
                severity = %severity,
                "{} pattern detected",
                self.name()
            );

            let (outlier_type, details) = match self.direction {
                FanDirection::Out => (
                    OutlierType::PatternFanOut,
                    OutlierDetails::FanOut {
                        distinct_recipients: distinct,
                        threshold: self.config.threshold,
                        transaction_count: fan.transactions,
                        total_sent: fan.total.clone(),
                        window_secs: self.config.window_secs,
                    },
                ),
                FanDirection::In => (
                    OutlierType::PatternFanIn,
                    OutlierDetails::FanIn {
                        distinct_senders: distinct,
                        threshold: self.config.threshold,
                        transaction_count: fan.transactions,
                        total_received: fan.total.clone(),
                        window_secs: self.config.window_secs,
                    },
                ),
            };
            let mut outlier = Outlier::new(outlier_type, severity, hub, details);
            outlier.amount = Some(fan.total);
            outliers.push(outlier);
        }
        Ok(outliers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::patterns::testing::{context, graph_with, tx};
    use crate::types::{Severity, Transaction};

    fn config(threshold: usize) -> FanConfig {
        FanConfig {
            threshold,
            ..FanConfig::default()
        }
    }

    fn spray(from: &str, recipients: usize) -> Vec<Transaction> {
        (0..recipients)
            .map(|i| tx(&format!("{}-{}", from, i), from, &format!("R{}", i), "10", i as i64))
            .collect()
    }

    #[test]
    fn test_fan_out_over_threshold() {
        let graph = graph_with(spray("hub", 25));
        let detector = FanDetector::new(FanDirection::Out, config(20));
        let outliers = detector.run(&context(graph, 100)).unwrap();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].address, "hub");
        assert_eq!(outliers[0].outlier_type, OutlierType::PatternFanOut);
        assert_eq!(outliers[0].severity, Severity::Low);
        assert_eq!(outliers[0].amount, Some(BigDecimal::from(250)));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let graph = graph_with(spray("hub", 20));
        let detector = FanDetector::new(FanDirection::Out, config(20));
        assert!(detector.run(&context(graph, 100)).unwrap().is_empty());
    }

    #[test]
    fn test_repeat_recipients_count_once() {
        let mut txs = spray("hub", 3);
        for i in 0..30 {
            txs.push(tx(&format!("again-{}", i), "hub", "R0", "1", 10 + i));
        }
        let detector = FanDetector::new(FanDirection::Out, config(5));
        assert!(detector.run(&context(graph_with(txs), 100)).unwrap().is_empty());
    }

    #[test]
    fn test_fan_in_collects_distinct_senders() {
        let txs: Vec<_> = (0..12)
            .map(|i| tx(&format!("in-{}", i), &format!("S{}", i), "sink", "5", i))
            .collect();
        let detector = FanDetector::new(FanDirection::In, config(2));
        let outliers = detector.run(&context(graph_with(txs), 100)).unwrap();
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].address, "sink");
        assert_eq!(outliers[0].outlier_type, OutlierType::PatternFanIn);
        // 12 / 2 = 6.
        assert_eq!(outliers[0].severity, Severity::High);
    }

    #[test]
    fn test_outside_lookback_is_ignored() {
        let graph = graph_with(spray("hub", 25));
        let detector = FanDetector::new(FanDirection::Out, config(20));
        // Fan-out lookback is one hour; the spray happened two hours before.
        assert!(detector.run(&context(graph, 7_200 + 30)).unwrap().is_empty());
    }
}
