use std::collections::BTreeSet;

use crate::config::ZScoreConfig;
use crate::error::DetectorError;
use crate::types::{Outlier, OutlierDetails, OutlierType, Transaction};

use super::stats::mean_std;
use super::{DetectionContext, Detector};

/// Flags amounts whose z-score against the window meets the threshold.
pub struct ZScoreDetector {
    config: ZScoreConfig,
}

impl ZScoreDetector {
    pub fn new(config: ZScoreConfig) -> Self {
        Self { config }
    }

    /// `None` when the window is too small to judge.
    pub fn detect(&self, transactions: &[Transaction]) -> Option<Vec<Outlier>> {
        if transactions.len() < self.config.min_data_points {
            tracing::debug!(
                count = transactions.len(),
                min = self.config.min_data_points,
                "Z-score skipped: insufficient data"
            );
            return None;
        }

        let amounts: Vec<f64> = transactions.iter().map(Transaction::amount_f64).collect();
        let (mean, std_dev) = mean_std(&amounts);
        tracing::debug!(count = amounts.len(), mean, std_dev, "Z-score window statistics");

        if std_dev == 0.0 {
            return Some(Vec::new());
        }

        let outliers = transactions
            .iter()
            .zip(&amounts)
            .filter_map(|(tx, amount)| {
                let z = (amount - mean) / std_dev;
                if z.abs() < self.config.threshold {
                    return None;
                }
                let severity = self.config.bands.classify(z.abs());
                tracing::info!(
                    tx_hash = %tx.tx_hash,
                    z_score = z,
                    severity = %severity,
                    "Z-score outlier detected"
                );
                let details = OutlierDetails::ZScore {
                    z_score: z,
                    mean,
                    std_dev,
                    threshold: self.config.threshold,
                    sample_size: amounts.len(),
                    from: tx.from.clone(),
                    to: tx.to.clone(),
                    block_number: tx.block_number,
                    timestamp: tx.timestamp,
                };
                Some(
                    Outlier::new(OutlierType::ZScore, severity, tx.from.clone(), details)
                        .for_transaction(tx)
                        .with_z_score(z),
                )
            })
            .collect();
        Some(outliers)
    }

    /// Same check against the sender's own history only.
    pub fn detect_by_address(
        &self,
        address: &str,
        transactions: &[Transaction],
    ) -> Option<Vec<Outlier>> {
        let own: Vec<Transaction> = transactions
            .iter()
            .filter(|tx| tx.from == address)
            .cloned()
            .collect();
        self.detect(&own)
    }
}

impl Detector for ZScoreDetector {
    fn name(&self) -> &'static str {
        "zscore"
    }

    fn run(&self, ctx: &DetectionContext) -> Result<Vec<Outlier>, DetectorError> {
        let window = ctx.recent(self.config.window_secs)?;
        let mut outliers = self.detect(&window).unwrap_or_default();

        if self.config.per_address {
            let senders: BTreeSet<&str> = window.iter().map(|tx| tx.from.as_str()).collect();
            for sender in senders {
                if let Some(found) = self.detect_by_address(sender, &window) {
                    outliers.extend(found);
                }
            }
        }
        Ok(outliers)
    }
}
