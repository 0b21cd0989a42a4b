use serde::Serialize;

use crate::error::StatsError;
use crate::types::Transaction;

/// Descriptive statistics over a window of transfer amounts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticalData {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub iqr: f64,
}

pub fn calculate_statistics(transactions: &[Transaction]) -> Result<StatisticalData, StatsError> {
    let amounts: Vec<f64> = transactions.iter().map(Transaction::amount_f64).collect();
    summarize(&amounts)
}

pub fn summarize(values: &[f64]) -> Result<StatisticalData, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptyInput);
    }

    let (mean, std_dev) = mean_std(values);
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (q1, median, q3) = quartiles(&sorted);

    Ok(StatisticalData {
        count: values.len(),
        mean,
        std_dev,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        q1,
        median,
        q3,
        iqr: q3 - q1,
    })
}

/// Mean and population standard deviation, two-pass to avoid cancellation on large amounts.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Q1, median and Q3 of an ascending slice.
pub fn quartiles(sorted: &[f64]) -> (f64, f64, f64) {
    (
        quantile(sorted, 0.25),
        quantile(sorted, 0.5),
        quantile(sorted, 0.75),
    )
}

/// Linear interpolation at position `p * (n - 1)` of an ascending slice.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            let frac = pos - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * frac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_over_five_values() {
        let stats = summarize(&[100.0, 110.0, 120.0, 130.0, 140.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.mean, 120.0);
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.max, 140.0);
        assert!(stats.std_dev > 0.0);
        assert!((stats.std_dev - 200f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.median, 120.0);
        assert_eq!(stats.q1, 110.0);
        assert_eq!(stats.q3, 130.0);
        assert_eq!(stats.iqr, 20.0);
    }

    #[test]
    fn test_statistics_over_transactions() {
        use crate::detection::patterns::testing::tx;

        let txs: Vec<_> = ["100", "110.00", "120", "130.0", "140"]
            .iter()
            .enumerate()
            .map(|(i, amount)| tx(&format!("0x{}", i), "TA", "TB", amount, i as i64))
            .collect();
        let stats = calculate_statistics(&txs).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.mean, 120.0);
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.max, 140.0);
        assert!((stats.std_dev - 200f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.median, 120.0);
        assert_eq!(stats.q1, 110.0);
        assert_eq!(stats.q3, 130.0);
        assert_eq!(stats.iqr, 20.0);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert_eq!(summarize(&[]), Err(StatsError::EmptyInput));
        assert_eq!(calculate_statistics(&[]), Err(StatsError::EmptyInput));
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted: Vec<f64> = (100..120).map(f64::from).collect();
        assert!((quantile(&sorted, 0.25) - 104.75).abs() < 1e-9);
        assert!((quantile(&sorted, 0.75) - 114.25).abs() < 1e-9);
        assert_eq!(quantile(&[7.0], 0.9), 7.0);
    }

    #[test]
    fn test_unsorted_input_is_sorted_first() {
        let stats = summarize(&[140.0, 100.0, 130.0, 110.0, 120.0]).unwrap();
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.q1, 110.0);
    }

    #[test]
    fn test_large_amounts_keep_precision() {
        let base = 1.0e12;
        let values = [base + 1.0, base + 2.0, base + 3.0];
        let (mean, std) = mean_std(&values);
        assert_eq!(mean, base + 2.0);
        assert!((std - (2.0f64 / 3.0).sqrt()).abs() < 1e-3);
    }
}
