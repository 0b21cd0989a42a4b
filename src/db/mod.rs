pub mod audit_logs;
pub mod outliers;

pub use audit_logs::PgAuditSink;
pub use outliers::{
    MemoryOutlierStore, OutlierFilter, OutlierPage, OutlierStore, OutlierSummary,
    PgOutlierStore, TrendPoint,
};
