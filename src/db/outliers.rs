use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::types::{Outlier, OutlierDetails, OutlierType, Severity};

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct OutlierFilter {
    pub outlier_type: Option<OutlierType>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

impl Default for OutlierFilter {
    fn default() -> Self {
        Self {
            outlier_type: None,
            severity: None,
            acknowledged: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl OutlierFilter {
    fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.limit)
    }

    fn matches(&self, outlier: &Outlier) -> bool {
        self.outlier_type.map_or(true, |t| outlier.outlier_type == t)
            && self.severity.map_or(true, |s| outlier.severity == s)
            && self.acknowledged.map_or(true, |a| outlier.acknowledged == a)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlierPage {
    pub outliers: Vec<Outlier>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutlierSummary {
    pub total: i64,
    pub unacknowledged: i64,
    pub last_24h: i64,
    pub by_severity: BTreeMap<Severity, i64>,
    pub by_type: BTreeMap<OutlierType, i64>,
}

/// Outliers detected on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub total: i64,
    pub by_severity: BTreeMap<Severity, i64>,
}

/// Durable record of detected outliers, unique on `(subject, type)`.
///
/// Uniqueness does not expire: an address-level outlier (fan-out, fan-in, dormant,
/// velocity) is recorded and forwarded once per address and type, however much later
/// or more severe a repeat detection is. Review repeat offenders through `list`.
#[async_trait]
pub trait OutlierStore: Send + Sync {
    /// Atomically insert the outliers whose key is not yet recorded; returns those inserted.
    async fn insert_new(&self, outliers: &[Outlier]) -> eyre::Result<Vec<Outlier>>;

    async fn get(&self, id: Uuid) -> eyre::Result<Option<Outlier>>;

    /// Newest first.
    async fn list(&self, filter: &OutlierFilter) -> eyre::Result<OutlierPage>;

    /// `None` if no outlier has this id.
    async fn acknowledge(
        &self,
        id: Uuid,
        user_id: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> eyre::Result<Option<Outlier>>;

    async fn summary(&self) -> eyre::Result<OutlierSummary>;

    async fn trends(&self, since: DateTime<Utc>) -> eyre::Result<Vec<TrendPoint>>;
}

// ============================================================
// In-memory store
// ============================================================

#[derive(Default)]
struct MemoryState {
    outliers: Vec<Outlier>,
    keys: HashSet<(String, OutlierType)>,
}

#[derive(Default)]
pub struct MemoryOutlierStore {
    state: RwLock<MemoryState>,
}

impl MemoryOutlierStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().outliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Outlier> {
        self.state.read().outliers.clone()
    }
}

#[async_trait]
impl OutlierStore for MemoryOutlierStore {
    async fn insert_new(&self, outliers: &[Outlier]) -> eyre::Result<Vec<Outlier>> {
        let mut state = self.state.write();
        let mut inserted = Vec::new();
        for outlier in outliers {
            if state.keys.insert(outlier.dedup_key()) {
                state.outliers.push(outlier.clone());
                inserted.push(outlier.clone());
            }
        }
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> eyre::Result<Option<Outlier>> {
        Ok(self
            .state
            .read()
            .outliers
            .iter()
            .find(|o| o.id == id)
            .cloned())
    }

    async fn list(&self, filter: &OutlierFilter) -> eyre::Result<OutlierPage> {
        let state = self.state.read();
        let mut matching: Vec<&Outlier> =
            state.outliers.iter().filter(|o| filter.matches(o)).collect();
        matching.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));

        let total = matching.len() as i64;
        let outliers = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect();
        Ok(OutlierPage {
            outliers,
            total,
            page: filter.page,
            limit: filter.limit,
        })
    }

    async fn acknowledge(
        &self,
        id: Uuid,
        user_id: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> eyre::Result<Option<Outlier>> {
        let mut state = self.state.write();
        let Some(outlier) = state.outliers.iter_mut().find(|o| o.id == id) else {
            return Ok(None);
        };
        outlier.acknowledged = true;
        outlier.acknowledged_by = Some(user_id.to_string());
        outlier.acknowledged_at = Some(at);
        outlier.notes = notes.map(str::to_string);
        Ok(Some(outlier.clone()))
    }

    async fn summary(&self) -> eyre::Result<OutlierSummary> {
        let state = self.state.read();
        let since = Utc::now() - Duration::hours(24);
        let mut summary = OutlierSummary::default();
        for o in &state.outliers {
            summary.total += 1;
            if !o.acknowledged {
                summary.unacknowledged += 1;
            }
            if o.detected_at > since {
                summary.last_24h += 1;
            }
            *summary.by_severity.entry(o.severity).or_default() += 1;
            *summary.by_type.entry(o.outlier_type).or_default() += 1;
        }
        Ok(summary)
    }

    async fn trends(&self, since: DateTime<Utc>) -> eyre::Result<Vec<TrendPoint>> {
        let state = self.state.read();
        let mut days: BTreeMap<NaiveDate, BTreeMap<Severity, i64>> = BTreeMap::new();
        for o in state.outliers.iter().filter(|o| o.detected_at >= since) {
            *days
                .entry(o.detected_at.date_naive())
                .or_default()
                .entry(o.severity)
                .or_default() += 1;
        }
        Ok(days
            .into_iter()
            .map(|(date, by_severity)| TrendPoint {
                date,
                total: by_severity.values().sum(),
                by_severity,
            })
            .collect())
    }
}

// ============================================================
// Postgres store
// ============================================================

const OUTLIER_COLUMNS: &str = "id, detected_at, type, severity, address, transaction_hash, \
     amount, z_score, details, acknowledged, acknowledged_by, acknowledged_at, notes";

type OutlierRow = (
    Uuid,
    DateTime<Utc>,
    String,
    String,
    String,
    Option<String>,
    Option<BigDecimal>,
    Option<f64>,
    JsonValue,
    bool,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<String>,
);

fn outlier_from_row(row: OutlierRow) -> eyre::Result<Outlier> {
    let (
        id,
        detected_at,
        outlier_type,
        severity,
        address,
        transaction_hash,
        amount,
        z_score,
        details,
        acknowledged,
        acknowledged_by,
        acknowledged_at,
        notes,
    ) = row;
    let details: OutlierDetails = serde_json::from_value(details)
        .map_err(|e| eyre::eyre!("Invalid details for outlier {}: {}", id, e))?;
    Ok(Outlier {
        id,
        detected_at,
        outlier_type: outlier_type.parse().map_err(|e: String| eyre::eyre!(e))?,
        severity: severity.parse().map_err(|e: String| eyre::eyre!(e))?,
        address,
        transaction_hash,
        amount,
        z_score,
        details,
        acknowledged,
        acknowledged_by,
        acknowledged_at,
        notes,
    })
}

pub struct PgOutlierStore {
    pool: PgPool,
}

impl PgOutlierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_filters(query_builder: &mut QueryBuilder<'_, Postgres>, filter: &OutlierFilter) {
    if let Some(outlier_type) = filter.outlier_type {
        query_builder
            .push(" AND type = ")
            .push_bind(outlier_type.as_str());
    }
    if let Some(severity) = filter.severity {
        query_builder.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(acknowledged) = filter.acknowledged {
        query_builder
            .push(" AND acknowledged = ")
            .push_bind(acknowledged);
    }
}

#[async_trait]
impl OutlierStore for PgOutlierStore {
    async fn insert_new(&self, outliers: &[Outlier]) -> eyre::Result<Vec<Outlier>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for outlier in outliers {
            let row: Option<(Uuid,)> = sqlx::query_as(
                "INSERT INTO outliers (id, detected_at, type, severity, address, subject, \
                 transaction_hash, amount, z_score, details)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (subject, type) DO NOTHING
                 RETURNING id",
            )
            .bind(outlier.id)
            .bind(outlier.detected_at)
            .bind(outlier.outlier_type.as_str())
            .bind(outlier.severity.as_str())
            .bind(&outlier.address)
            .bind(outlier.subject())
            .bind(&outlier.transaction_hash)
            .bind(&outlier.amount)
            .bind(outlier.z_score)
            .bind(outlier.details.to_json())
            .fetch_optional(&mut *tx)
            .await?;

            if row.is_some() {
                inserted.push(outlier.clone());
            } else {
                tracing::debug!(
                    subject = outlier.subject(),
                    outlier_type = outlier.outlier_type.as_str(),
                    "Outlier already recorded"
                );
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get(&self, id: Uuid) -> eyre::Result<Option<Outlier>> {
        let row: Option<OutlierRow> = sqlx::query_as(&format!(
            "SELECT {} FROM outliers WHERE id = $1",
            OUTLIER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(outlier_from_row).transpose()
    }

    async fn list(&self, filter: &OutlierFilter) -> eyre::Result<OutlierPage> {
        let mut count_query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM outliers WHERE TRUE");
        push_filters(&mut count_query, filter);
        let (total,): (i64,) = count_query
            .build_query_as()
            .fetch_one(&self.pool)
            .await?;

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM outliers WHERE TRUE",
            OUTLIER_COLUMNS
        ));
        push_filters(&mut query_builder, filter);
        query_builder
            .push(" ORDER BY detected_at DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(filter.offset());
        let rows: Vec<OutlierRow> = query_builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        Ok(OutlierPage {
            outliers: rows
                .into_iter()
                .map(outlier_from_row)
                .collect::<eyre::Result<_>>()?,
            total,
            page: filter.page,
            limit: filter.limit,
        })
    }

    async fn acknowledge(
        &self,
        id: Uuid,
        user_id: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> eyre::Result<Option<Outlier>> {
        let row: Option<OutlierRow> = sqlx::query_as(&format!(
            "UPDATE outliers
             SET acknowledged = TRUE, acknowledged_by = $2, acknowledged_at = $3, notes = $4
             WHERE id = $1
             RETURNING {}",
            OUTLIER_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .bind(at)
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?;

        row.map(outlier_from_row).transpose()
    }

    async fn summary(&self) -> eyre::Result<OutlierSummary> {
        let (total, unacknowledged, last_24h): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE NOT acknowledged),
                    COUNT(*) FILTER (WHERE detected_at > NOW() - INTERVAL '24 hours')
             FROM outliers",
        )
        .fetch_one(&self.pool)
        .await?;

        let severities: Vec<(String, i64)> =
            sqlx::query_as("SELECT severity, COUNT(*) FROM outliers GROUP BY severity")
                .fetch_all(&self.pool)
                .await?;
        let types: Vec<(String, i64)> =
            sqlx::query_as("SELECT type, COUNT(*) FROM outliers GROUP BY type")
                .fetch_all(&self.pool)
                .await?;

        let mut summary = OutlierSummary {
            total,
            unacknowledged,
            last_24h,
            ..OutlierSummary::default()
        };
        for (severity, count) in severities {
            let severity: Severity = severity.parse().map_err(|e: String| eyre::eyre!(e))?;
            summary.by_severity.insert(severity, count);
        }
        for (outlier_type, count) in types {
            let outlier_type: OutlierType =
                outlier_type.parse().map_err(|e: String| eyre::eyre!(e))?;
            summary.by_type.insert(outlier_type, count);
        }
        Ok(summary)
    }

    async fn trends(&self, since: DateTime<Utc>) -> eyre::Result<Vec<TrendPoint>> {
        let rows: Vec<(NaiveDate, String, i64)> = sqlx::query_as(
            "SELECT (detected_at AT TIME ZONE 'UTC')::date AS day, severity, COUNT(*)
             FROM outliers
             WHERE detected_at >= $1
             GROUP BY day, severity
             ORDER BY day",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut days: BTreeMap<NaiveDate, BTreeMap<Severity, i64>> = BTreeMap::new();
        for (day, severity, count) in rows {
            let severity: Severity = severity.parse().map_err(|e: String| eyre::eyre!(e))?;
            days.entry(day).or_default().insert(severity, count);
        }
        Ok(days
            .into_iter()
            .map(|(date, by_severity)| TrendPoint {
                date,
                total: by_severity.values().sum(),
                by_severity,
            })
            .collect())
    }
}
