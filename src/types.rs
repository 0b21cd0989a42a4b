use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A validated stablecoin transfer, as delivered by the ingestion feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub amount: BigDecimal,
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
    #[serde(default)]
    pub contract: String,
    #[serde(default)]
    pub confirmed: bool,
}

impl Transaction {
    /// Amount as f64 for the statistical detectors.
    pub fn amount_f64(&self) -> f64 {
        self.amount.to_f64().unwrap_or(0.0)
    }
}

/// Types of outliers the detectors can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutlierType {
    #[serde(rename = "zscore")]
    ZScore,
    #[serde(rename = "iqr")]
    Iqr,
    #[serde(rename = "pattern_circulation")]
    PatternCirculation,
    #[serde(rename = "pattern_fanout")]
    PatternFanOut,
    #[serde(rename = "pattern_fanin")]
    PatternFanIn,
    #[serde(rename = "pattern_dormant")]
    PatternDormant,
    #[serde(rename = "pattern_velocity")]
    PatternVelocity,
}

impl OutlierType {
    pub const ALL: [OutlierType; 7] = [
        Self::ZScore,
        Self::Iqr,
        Self::PatternCirculation,
        Self::PatternFanOut,
        Self::PatternFanIn,
        Self::PatternDormant,
        Self::PatternVelocity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZScore => "zscore",
            Self::Iqr => "iqr",
            Self::PatternCirculation => "pattern_circulation",
            Self::PatternFanOut => "pattern_fanout",
            Self::PatternFanIn => "pattern_fanin",
            Self::PatternDormant => "pattern_dormant",
            Self::PatternVelocity => "pattern_velocity",
        }
    }
}

impl fmt::Display for OutlierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutlierType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown outlier type '{}'", s))
    }
}

/// Ordered severity tiers shared by every detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One tier up, saturating at critical.
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown severity '{}'", s))
    }
}

/// Cut points mapping a detector's deviation metric onto a severity.
/// A metric below `medium` is low; at or above `critical` it is critical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityBands {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl SeverityBands {
    pub const fn new(medium: f64, high: f64, critical: f64) -> Self {
        Self {
            medium,
            high,
            critical,
        }
    }

    pub fn classify(&self, metric: f64) -> Severity {
        if metric >= self.critical {
            Severity::Critical
        } else if metric >= self.high {
            Severity::High
        } else if metric >= self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn is_increasing(&self) -> bool {
        self.medium.is_finite()
            && self.critical.is_finite()
            && self.medium < self.high
            && self.high < self.critical
    }
}

/// Detector-specific evidence attached to an outlier.
/// Flattened to a JSON object only when persisted or sent downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum OutlierDetails {
    ZScore {
        z_score: f64,
        mean: f64,
        std_dev: f64,
        threshold: f64,
        sample_size: usize,
        from: String,
        to: String,
        block_number: u64,
        timestamp: DateTime<Utc>,
    },
    Iqr {
        q1: f64,
        q3: f64,
        iqr: f64,
        lower_bound: f64,
        upper_bound: f64,
        deviation: f64,
        multiplier: f64,
        sample_size: usize,
        from: String,
        to: String,
        block_number: u64,
        timestamp: DateTime<Utc>,
    },
    Circulation {
        addresses: Vec<String>,
        tx_hashes: Vec<String>,
        hops: usize,
        total_amount: BigDecimal,
        min_amount: f64,
        window_secs: u64,
    },
    FanOut {
        distinct_recipients: usize,
        threshold: usize,
        transaction_count: usize,
        total_sent: BigDecimal,
        window_secs: u64,
    },
    FanIn {
        distinct_senders: usize,
        threshold: usize,
        transaction_count: usize,
        total_received: BigDecimal,
        window_secs: u64,
    },
    Dormant {
        previous_activity: DateTime<Utc>,
        reactivated_at: DateTime<Utc>,
        dormant_secs: i64,
        dormancy_threshold_secs: u64,
        historical_mean: f64,
        historical_count: usize,
    },
    Velocity {
        transaction_count: usize,
        max_transactions: usize,
        window_secs: u64,
        per_hour: f64,
    },
}

impl OutlierDetails {
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// A flagged transaction or address behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlier {
    pub id: Uuid,
    pub detected_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub outlier_type: OutlierType,
    pub severity: Severity,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<BigDecimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    pub details: OutlierDetails,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Outlier {
    pub fn new(
        outlier_type: OutlierType,
        severity: Severity,
        address: impl Into<String>,
        details: OutlierDetails,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            detected_at: Utc::now(),
            outlier_type,
            severity,
            address: address.into(),
            transaction_hash: None,
            amount: None,
            z_score: None,
            details,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            notes: None,
        }
    }

    /// Attach the offending transaction's hash and amount.
    pub fn for_transaction(mut self, tx: &Transaction) -> Self {
        self.transaction_hash = Some(tx.tx_hash.clone());
        self.amount = Some(tx.amount.clone());
        self
    }

    pub fn with_z_score(mut self, z_score: f64) -> Self {
        self.z_score = Some(z_score);
        self
    }

    /// The transaction hash when the outlier concerns one transfer, else the address.
    pub fn subject(&self) -> &str {
        self.transaction_hash.as_deref().unwrap_or(&self.address)
    }

    pub fn dedup_key(&self) -> (String, OutlierType) {
        (self.subject().to_string(), self.outlier_type)
    }
}
