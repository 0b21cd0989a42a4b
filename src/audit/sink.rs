use async_trait::async_trait;
use parking_lot::RwLock;

use super::AuditLogEntry;

/// Append-only storage behind the audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> eyre::Result<()>;

    /// Highest-sequence entry, used to resume the chain on startup.
    async fn last(&self) -> eyre::Result<Option<AuditLogEntry>>;

    /// Every entry in sequence order.
    async fn entries(&self) -> eyre::Result<Vec<AuditLogEntry>>;
}

/// In-process sink for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Direct access to the stored rows, bypassing the trail.
    pub fn with_rows_mut<R>(&self, f: impl FnOnce(&mut Vec<AuditLogEntry>) -> R) -> R {
        f(&mut self.entries.write())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: &AuditLogEntry) -> eyre::Result<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn last(&self) -> eyre::Result<Option<AuditLogEntry>> {
        Ok(self.entries.read().last().cloned())
    }

    async fn entries(&self) -> eyre::Result<Vec<AuditLogEntry>> {
        Ok(self.entries.read().clone())
    }
}
