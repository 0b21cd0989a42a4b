use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;

use crate::audit::{AuditLogEntry, AuditSink};

const AUDIT_COLUMNS: &str = "sequence, timestamp, user_id, action, resource, method, path, \
     status_code, ip_address, user_agent, details, signature";

type AuditRow = (
    i64,
    DateTime<Utc>,
    Option<String>,
    String,
    String,
    String,
    String,
    i32,
    Option<String>,
    Option<String>,
    JsonValue,
    String,
);

fn entry_from_row(row: AuditRow) -> AuditLogEntry {
    let (
        sequence,
        timestamp,
        user_id,
        action,
        resource,
        method,
        path,
        status_code,
        ip_address,
        user_agent,
        details,
        signature,
    ) = row;
    AuditLogEntry {
        sequence,
        timestamp,
        user_id,
        action,
        resource,
        method,
        path,
        status_code,
        ip_address,
        user_agent,
        details,
        signature,
    }
}

/// Audit sink over the append-only `audit_logs` table.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, entry: &AuditLogEntry) -> eyre::Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (sequence, timestamp, user_id, action, resource, method, \
             path, status_code, ip_address, user_agent, details, signature)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(entry.sequence)
        .bind(entry.timestamp)
        .bind(&entry.user_id)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(entry.status_code)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.details)
        .bind(&entry.signature)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last(&self) -> eyre::Result<Option<AuditLogEntry>> {
        let row: Option<AuditRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_logs ORDER BY sequence DESC LIMIT 1",
            AUDIT_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(entry_from_row))
    }

    async fn entries(&self) -> eyre::Result<Vec<AuditLogEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_logs ORDER BY sequence ASC",
            AUDIT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(entry_from_row).collect())
    }
}
