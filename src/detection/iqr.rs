use std::collections::BTreeSet;

use crate::config::IqrConfig;
use crate::error::DetectorError;
use crate::types::{Outlier, OutlierDetails, OutlierType, Transaction};

use super::stats::quartiles;
use super::{DetectionContext, Detector};

/// Tukey fences over transfer amounts.
pub struct IqrDetector {
    config: IqrConfig,
}

impl IqrDetector {
    pub fn new(config: IqrConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, transactions: &[Transaction]) -> Option<Vec<Outlier>> {
        if transactions.len() < self.config.min_data_points {
            tracing::debug!(
                count = transactions.len(),
                min = self.config.min_data_points,
                "IQR skipped: insufficient data"
            );
            return None;
        }

        let amounts: Vec<f64> = transactions.iter().map(Transaction::amount_f64).collect();
        let mut sorted = amounts.clone();
        sorted.sort_by(f64::total_cmp);
        let (q1, _, q3) = quartiles(&sorted);
        let iqr = q3 - q1;
        let lower_bound = q1 - self.config.multiplier * iqr;
        let upper_bound = q3 + self.config.multiplier * iqr;
        tracing::debug!(q1, q3, iqr, lower_bound, upper_bound, "IQR window bounds");

        let outliers = transactions
            .iter()
            .zip(&amounts)
            .filter_map(|(tx, &amount)| {
                let beyond = if amount > upper_bound {
                    amount - upper_bound
                } else if amount < lower_bound {
                    lower_bound - amount
                } else {
                    return None;
                };
                // Distance past the fence in IQRs; a zero IQR has no scale.
                let deviation = if iqr > 0.0 { beyond / iqr } else { 0.0 };
                let severity = self.config.bands.classify(deviation);
                tracing::info!(
                    tx_hash = %tx.tx_hash,
                    amount,
                    deviation,
                    severity = %severity,
                    "IQR outlier detected"
                );
                let details = OutlierDetails::Iqr {
                    q1,
                    q3,
                    iqr,
                    lower_bound,
                    upper_bound,
                    deviation,
                    multiplier: self.config.multiplier,
                    sample_size: amounts.len(),
                    from: tx.from.clone(),
                    to: tx.to.clone(),
                    block_number: tx.block_number,
                    timestamp: tx.timestamp,
                };
                Some(
                    Outlier::new(OutlierType::Iqr, severity, tx.from.clone(), details)
                        .for_transaction(tx),
                )
            })
            .collect();
        Some(outliers)
    }

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

impl Detector for IqrDetector {
    fn name(&self) -> &'static str {
        "iqr"
    }

    fn run(&self, ctx: &DetectionContext) -> Result<Vec<Outlier>, DetectorError> {
        let window = ctx.recent(self.config.window_secs)?;
        let mut outliers = self.detect(&window).unwrap_or_default();

        if self.config.per_address {
            let senders: BTreeSet<&str> = window.iter().map(|tx| tx.from.as_str()).collect();
            for sender in senders {
                outliers.extend(self.detect_by_address(sender, &window).unwrap_or_default());
            }
        }
        Ok(outliers)
    }
}
