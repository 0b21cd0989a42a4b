pub mod iqr;
pub mod orchestrator;
pub mod patterns;
pub mod stats;
pub mod zscore;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::{DetectorError, GraphError};
use crate::graph::TemporalGraph;
use crate::types::{Outlier, Transaction};

pub use orchestrator::{DetectorFailure, Orchestrator, RunReport, RunState};

/// Everything a detector sees during one run.
#[derive(Clone)]
pub struct DetectionContext {
    pub graph: Arc<TemporalGraph>,
    /// Transfers in `[start, end]`, oldest first. When capped at
    /// `max_window_transactions`, the newest are kept.
    pub window: Arc<Vec<Transaction>>,
    pub start: DateTime<Utc>,
    /// Reference time of the run.
    pub end: DateTime<Utc>,
}

impl DetectionContext {
    /// Pull `[end - window_secs, end]` from the graph.
    pub fn load(
        graph: Arc<TemporalGraph>,
        end: DateTime<Utc>,
        window_secs: u64,
        max_window_transactions: usize,
    ) -> Result<Self, GraphError> {
        let mut ctx = Self {
            graph,
            window: Arc::new(Vec::new()),
            start: end,
            end,
        };
        ctx.start = ctx.lookback(window_secs);
        // A capped window keeps the newest transfers so short lookbacks stay complete.
        let window = ctx
            .graph
            .get_latest_window(ctx.start, end, max_window_transactions)?;
        if window.len() == max_window_transactions {
            tracing::warn!(
                limit = max_window_transactions,
                oldest = ?window.first().map(|tx| tx.timestamp),
                "Detection window truncated to the newest max_window_transactions"
            );
        }
        ctx.window = Arc::new(window);
        Ok(ctx)
    }

    /// Start of a detector-specific lookback ending at the run's reference time.
    pub fn lookback(&self, window_secs: u64) -> DateTime<Utc> {
        i64::try_from(window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|span| self.end.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Transfers of the last `window_secs`. Served from the run window when it covers
    /// the lookback, otherwise read from the graph.
    pub fn recent(&self, window_secs: u64) -> Result<Vec<Transaction>, DetectorError> {
        let since = self.lookback(window_secs);
        if since >= self.start {
            return Ok(self
                .window
                .iter()
                .filter(|tx| tx.timestamp >= since)
                .cloned()
                .collect());
        }
        Ok(self.graph.get_window(since, self.end, usize::MAX)?)
    }
}

/// A detector evaluated by the orchestrator on a blocking worker.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &DetectionContext) -> Result<Vec<Outlier>, DetectorError>;
}
