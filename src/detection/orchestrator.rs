use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditTrail};
use crate::config::DetectionConfig;
use crate::db::OutlierStore;
use crate::error::{DetectorError, RunError};
use crate::graph::TemporalGraph;
use crate::types::{Outlier, OutlierType, Severity};

use super::iqr::IqrDetector;
use super::patterns;
use super::zscore::ZScoreDetector;
use super::{DetectionContext, Detector};

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// A detector that errored, panicked or missed the deadline during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorFailure {
    pub detector: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub transactions_analyzed: usize,
    /// After merging duplicates across detectors.
    pub outliers_found: usize,
    /// Not previously recorded; these were persisted and forwarded.
    pub outliers_new: usize,
    pub failures: Vec<DetectorFailure>,
    pub counts_by_type: BTreeMap<OutlierType, usize>,
    pub counts_by_severity: BTreeMap<Severity, usize>,
    pub duration_ms: u64,
    /// Set when the outliers were persisted and forwarded but the run entry could not
    /// be written to the audit trail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_error: Option<String>,
}

/// Runs the enabled detectors over the graph, persists what is new, audits the run
/// and forwards fresh outliers to subscribers.
pub struct Orchestrator {
    config: DetectionConfig,
    graph: Arc<TemporalGraph>,
    detectors: Vec<Arc<dyn Detector>>,
    outliers: Arc<dyn OutlierStore>,
    audit: Arc<AuditTrail>,
    notifier: broadcast::Sender<Outlier>,
    state: Mutex<RunState>,
    last_report: Mutex<Option<RunReport>>,
}

impl Orchestrator {
    pub fn new(
        config: DetectionConfig,
        graph: Arc<TemporalGraph>,
        outliers: Arc<dyn OutlierStore>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();
        if config.zscore.enabled {
            detectors.push(Arc::new(ZScoreDetector::new(config.zscore.clone())));
        }
        if config.iqr.enabled {
            detectors.push(Arc::new(IqrDetector::new(config.iqr.clone())));
        }
        detectors.extend(patterns::build(&config.patterns));

        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            config,
            graph,
            detectors,
            outliers,
            audit,
            notifier,
            state: Mutex::new(RunState::Idle),
            last_report: Mutex::new(None),
        }
    }

    /// Replace the configured detector set.
    pub fn with_detectors(mut self, detectors: Vec<Arc<dyn Detector>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Newly persisted outliers, in detection order.
    pub fn subscribe(&self) -> broadcast::Receiver<Outlier> {
        self.notifier.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.lock().clone()
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        self.run_at(Utc::now(), cancel).await
    }

    /// One run over the window ending at `now`.
    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let guard = RunGuard::begin(&self.state)?;
        let run_id = Uuid::new_v4();
        let result = self.execute(run_id, now, cancel).await;

        match &result {
            Ok(report) => {
                guard.finish(report.state);
                *self.last_report.lock() = Some(report.clone());
            }
            Err(e) => {
                guard.finish(RunState::Failed);
                tracing::error!(run_id = %run_id, error = %e, "Detection run failed");
                self.audit_failure(run_id, now, e).await;
            }
        }
        result
    }

    async fn execute(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let ctx = DetectionContext::load(
            self.graph.clone(),
            now,
            self.config.window_secs,
            self.config.max_window_transactions,
        )
        .map_err(RunError::StoreUnavailable)?;
        tracing::debug!(
            run_id = %run_id,
            transactions = ctx.window.len(),
            detectors = self.detectors.len(),
            "Detection run started"
        );

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let results = tokio::select! {
            results = self.run_detectors(&ctx) => results,
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
        };

        let mut found = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(outliers) => {
                    tracing::debug!(detector = name, count = outliers.len(), "Detector finished");
                    found.extend(outliers);
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, detector = name, error = %e, "Detector failed");
                    failures.push(DetectorFailure {
                        detector: name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        if !self.detectors.is_empty() && failures.len() == self.detectors.len() {
            return Err(RunError::NoDetectorRan(failures));
        }

        let merged = merge_outliers(found);

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let inserted = self
            .outliers
            .insert_new(&merged)
            .await
            .map_err(RunError::Persistence)?;
        if inserted.len() < merged.len() {
            tracing::debug!(
                run_id = %run_id,
                suppressed = merged.len() - inserted.len(),
                "Duplicate outliers suppressed"
            );
        }

        let mut counts_by_type = BTreeMap::new();
        let mut counts_by_severity = BTreeMap::new();
        for outlier in &merged {
            *counts_by_type.entry(outlier.outlier_type).or_insert(0) += 1;
            *counts_by_severity.entry(outlier.severity).or_insert(0) += 1;
        }

        let mut report = RunReport {
            run_id,
            state: RunState::Completed,
            window_start: ctx.start,
            window_end: ctx.end,
            transactions_analyzed: ctx.window.len(),
            outliers_found: merged.len(),
            outliers_new: inserted.len(),
            failures,
            counts_by_type,
            counts_by_severity,
            duration_ms: started.elapsed().as_millis() as u64,
            audit_error: None,
        };

        // Committed outliers are never re-emitted, so they go out whatever the audit
        // write below does.
        for outlier in inserted {
            // No receivers is not an error.
            let _ = self.notifier.send(outlier);
        }

        let logged = self
            .audit
            .log(
                AuditEvent::system("detection.run", run_id.to_string())
                    .details(serde_json::to_value(&report).unwrap_or_default()),
            )
            .await;
        if let Err(e) = logged {
            tracing::error!(
                run_id = %run_id,
                error = %e,
                outliers_new = report.outliers_new,
                "Failed to audit detection run; outliers were persisted and forwarded"
            );
            report.audit_error = Some(e.to_string());
        }

        tracing::info!(
            run_id = %run_id,
            transactions = report.transactions_analyzed,
            found = report.outliers_found,
            new = report.outliers_new,
            failures = report.failures.len(),
            duration_ms = report.duration_ms,
            "Detection run completed"
        );
        Ok(report)
    }

    /// Every detector on a blocking worker, all bounded by one deadline.
    async fn run_detectors(
        &self,
        ctx: &DetectionContext,
    ) -> Vec<(&'static str, Result<Vec<Outlier>, DetectorError>)> {
        let secs = self.config.run_timeout_secs;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);

        let tasks = self.detectors.iter().map(|detector| {
            let detector = detector.clone();
            let ctx = ctx.clone();
            let name = detector.name();
            async move {
                let handle = tokio::task::spawn_blocking(move || detector.run(&ctx));
                // A timed-out worker keeps running, but its result is discarded.
                let result = match tokio::time::timeout_at(deadline, handle).await {
                    Err(_) => Err(DetectorError::Timeout { secs }),
                    Ok(Err(join_error)) => Err(DetectorError::Aborted(join_error.to_string())),
                    Ok(Ok(result)) => result,
                };
                (name, result)
            }
        });
        join_all(tasks).await
    }

    async fn audit_failure(&self, run_id: Uuid, now: DateTime<Utc>, error: &RunError) {
        let failures = match error {
            RunError::NoDetectorRan(failures) => failures.clone(),
            _ => Vec::new(),
        };
        let event = AuditEvent::system("detection.run", run_id.to_string())
            .status(500)
            .details(serde_json::json!({
                "run_id": run_id,
                "state": RunState::Failed,
                "window_end": now,
                "error": error.to_string(),
                "failures": failures,
            }));
        if let Err(e) = self.audit.log(event).await {
            tracing::error!(run_id = %run_id, error = %e, "Failed to audit failed detection run");
        }
    }

    /// Periodic detection until `shutdown` fires.
    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Detection disabled, loop not started");
            return;
        }
        let interval = Duration::from_secs(self.config.interval_secs);
        tracing::info!(
            interval_secs = self.config.interval_secs,
            detectors = ?self.detector_names(),
            "Detection loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => break,
            }

            match self.run_once(&shutdown).await {
                Ok(_) => {}
                Err(RunError::AlreadyRunning) => {
                    tracing::debug!("Previous detection run still in progress, skipping tick");
                }
                Err(RunError::Cancelled) => break,
                // Already logged and audited by run_at.
                Err(_) => {}
            }
        }
        tracing::info!("Detection loop stopped");
    }
}

/// Keep the highest-severity outlier per `(subject, type)`.
fn merge_outliers(found: Vec<Outlier>) -> Vec<Outlier> {
    let mut merged: BTreeMap<(String, OutlierType), Outlier> = BTreeMap::new();
    for outlier in found {
        let key = outlier.dedup_key();
        match merged.get(&key) {
            Some(existing) if existing.severity >= outlier.severity => {}
            _ => {
                merged.insert(key, outlier);
            }
        }
    }
    let mut merged: Vec<Outlier> = merged.into_values().collect();
    merged.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
    merged
}

/// Holds the run slot; a run dropped mid-flight is recorded as failed.
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn begin(state: &'a Mutex<RunState>) -> Result<Self, RunError> {
        let mut current = state.lock();
        if *current == RunState::Running {
            return Err(RunError::AlreadyRunning);
        }
        *current = RunState::Running;
        Ok(Self {
            state,
            finished: false,
        })
    }

    fn finish(mut self, outcome: RunState) {
        *self.state.lock() = outcome;
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = RunState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutlierDetails;

    fn velocity(address: &str, severity: Severity) -> Outlier {
        Outlier::new(
            OutlierType::PatternVelocity,
            severity,
            address,
            OutlierDetails::Velocity {
                transaction_count: 10,
                max_transactions: 5,
                window_secs: 3600,
                per_hour: 10.0,
            },
        )
    }

    #[test]
    fn test_merge_keeps_highest_severity() {
        let merged = merge_outliers(vec![
            velocity("A", Severity::Low),
            velocity("A", Severity::Critical),
            velocity("A", Severity::Medium),
            velocity("B", Severity::Low),
        ]);
        assert_eq!(merged.len(), 2);
        let a = merged.iter().find(|o| o.address == "A").unwrap();
        assert_eq!(a.severity, Severity::Critical);
    }

    #[test]
    fn test_guard_rejects_concurrent_runs() {
        let state = Mutex::new(RunState::Idle);
        let guard = RunGuard::begin(&state).unwrap();
        assert!(matches!(RunGuard::begin(&state), Err(RunError::AlreadyRunning)));
        guard.finish(RunState::Completed);
        assert_eq!(*state.lock(), RunState::Completed);

        let dropped = RunGuard::begin(&state).unwrap();
        drop(dropped);
        assert_eq!(*state.lock(), RunState::Failed);
    }
}
