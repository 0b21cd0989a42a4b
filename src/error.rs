use chrono::{DateTime, Utc};

/// Errors raised by the temporal graph store.
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid range: end {end} is before start {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Address not found: {0}")]
    NotFound(String),

    #[error("Snapshots require a persistent graph")]
    SnapshotUnsupported,

    #[error("Clearing the graph is disabled for this environment")]
    ClearForbidden,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StatsError {
    #[error("No transactions provided")]
    EmptyInput,
}

/// A single detector's failure within a run. Never aborts the other detectors.
#[derive(thiserror::Error, Debug)]
pub enum DetectorError {
    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),

    #[error("Graph query failed: {0}")]
    Graph(#[from] GraphError),

    #[error("Detector exceeded the run deadline of {secs}s")]
    Timeout { secs: u64 },

    #[error("Detector task aborted: {0}")]
    Aborted(String),
}

/// Errors that end a detection run without persisting anything.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("A detection run is already in progress")]
    AlreadyRunning,

    #[error("Graph store unavailable: {0}")]
    StoreUnavailable(#[source] GraphError),

    #[error("No detector completed ({} failed)", .0.len())]
    NoDetectorRan(Vec<crate::detection::orchestrator::DetectorFailure>),

    #[error("Detection run cancelled")]
    Cancelled,

    #[error("Persistence failure: {0}")]
    Persistence(eyre::Report),
}

#[derive(thiserror::Error, Debug)]
pub enum AuditError {
    #[error("Audit chain broken at sequence {sequence}: {reason}")]
    ChainBroken { sequence: i64, reason: String },

    #[error("Audit sink error: {0}")]
    Sink(eyre::Report),

    #[error("Audit encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors surfaced to the external API layer.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Persistence failure: {0}")]
    Persistence(eyre::Report),
}
