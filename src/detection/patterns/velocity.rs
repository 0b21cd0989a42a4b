use std::collections::BTreeMap;

use crate::config::VelocityConfig;
use crate::detection::{DetectionContext, Detector};
use crate::error::DetectorError;
use crate::types::{Outlier, OutlierDetails, OutlierType};

use super::ratio;

/// Addresses touching more than `max_transactions` transfers inside the lookback.
pub struct VelocityDetector {
    config: VelocityConfig,
}

impl VelocityDetector {
    pub fn new(config: VelocityConfig) -> Self {
        Self { config }
    }
}

impl Detector for VelocityDetector {
    fn name(&self) -> &'static str {
        "velocity"
    }

    fn run(&self, ctx: &DetectionContext) -> Result<Vec<Outlier>, DetectorError> {
        let window = ctx.recent(self.config.window_secs)?;

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for tx in &window {
            *counts.entry(tx.from.as_str()).or_default() += 1;
            if tx.to != tx.from {
                *counts.entry(tx.to.as_str()).or_default() += 1;
            }
        }

        let hours = (self.config.window_secs as f64 / 3600.0).max(f64::MIN_POSITIVE);
        let outliers = counts
            .into_iter()
            .filter(|(_, count)| *count > self.config.max_transactions)
            .map(|(address, count)| {
                let severity = self
                    .config
                    .bands
                    .classify(ratio(count as f64, self.config.max_transactions as f64));
                let per_hour = count as f64 / hours;
                tracing::info!(
                    address = %address,
                    count,
                    per_hour,
                    severity = %severity,
                    "Velocity spike detected"
                );
                Outlier::new(
                    OutlierType::PatternVelocity,
                    severity,
                    address,
                    OutlierDetails::Velocity {
                        transaction_count: count,
                        max_transactions: self.config.max_transactions,
                        window_secs: self.config.window_secs,
                        per_hour,
                    },
                )
            })
            .collect();
        Ok(outliers)
    }
}
