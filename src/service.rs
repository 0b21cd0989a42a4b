//! Operations exposed to the outer API layer.
//!
//! Reads are open to any authenticated caller. Privileged operations are checked
//! against the [`Authorizer`] and recorded in the audit trail, denials included.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditTrail};
use crate::db::outliers::MAX_PAGE_LIMIT;
use crate::db::{OutlierFilter, OutlierPage, OutlierStore, OutlierSummary, TrendPoint};
use crate::detection::{Orchestrator, RunReport};
use crate::error::{GraphError, RunError, ServiceError};
use crate::graph::{Direction, GraphStatistics, NodeInfo, Path, TemporalGraph};
use crate::types::{Outlier, Transaction};

const MAX_PATH_DEPTH: usize = 10;
const MAX_TREND_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    TriggerDetection,
    WriteOutliers,
    AdminGraph,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TriggerDetection => "trigger:detection",
            Self::WriteOutliers => "write:outliers",
            Self::AdminGraph => "admin:graph",
        }
    }
}

/// The caller of one request, as established by the authentication layer.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ip_address: None,
            user_agent: None,
        }
    }

    fn event(&self, action: &str, resource: impl Into<String>) -> AuditEvent {
        AuditEvent::system(action, resource).by_user(
            self.user_id.clone(),
            self.ip_address.clone(),
            self.user_agent.clone(),
        )
    }
}

pub trait Authorizer: Send + Sync {
    fn is_allowed(&self, identity: &Identity, permission: Permission) -> bool;
}

/// Fixed per-user grants, loaded once.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, HashSet<Permission>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user_id: &str, permissions: &[Permission]) -> Self {
        self.grants
            .entry(user_id.to_string())
            .or_default()
            .extend(permissions.iter().copied());
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn is_allowed(&self, identity: &Identity, permission: Permission) -> bool {
        self.grants
            .get(&identity.user_id)
            .is_some_and(|granted| granted.contains(&permission))
    }
}

pub struct MonitorService {
    graph: Arc<TemporalGraph>,
    outliers: Arc<dyn OutlierStore>,
    orchestrator: Arc<Orchestrator>,
    audit: Arc<AuditTrail>,
    authorizer: Arc<dyn Authorizer>,
    shutdown: CancellationToken,
}

impl MonitorService {
    pub fn new(
        graph: Arc<TemporalGraph>,
        outliers: Arc<dyn OutlierStore>,
        orchestrator: Arc<Orchestrator>,
        audit: Arc<AuditTrail>,
        authorizer: Arc<dyn Authorizer>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            graph,
            outliers,
            orchestrator,
            audit,
            authorizer,
            shutdown,
        }
    }

    /// Check `permission`, auditing a denial with status 403.
    async fn authorize(
        &self,
        identity: &Identity,
        permission: Permission,
        action: &str,
        resource: &str,
        path: &str,
    ) -> Result<(), ServiceError> {
        if self.authorizer.is_allowed(identity, permission) {
            return Ok(());
        }
        tracing::warn!(
            user_id = %identity.user_id,
            permission = permission.as_str(),
            action,
            "Permission denied"
        );
        self.audit
            .log(
                identity
                    .event(action, resource)
                    .request("POST", path)
                    .status(403)
                    .details(json!({ "required": permission.as_str() })),
            )
            .await?;
        Err(ServiceError::PermissionDenied(permission.as_str()))
    }

    // ============================================================
    // Ingestion
    // ============================================================

    pub fn ingest_transaction(&self, tx: Transaction) -> Result<bool, ServiceError> {
        Ok(self.graph.add_transaction(tx)?)
    }

    // ============================================================
    // Outliers
    // ============================================================

    pub async fn list_outliers(&self, filter: &OutlierFilter) -> Result<OutlierPage, ServiceError> {
        if filter.page == 0 {
            return Err(ServiceError::InvalidInput("page must be >= 1".to_string()));
        }
        if filter.limit == 0 || filter.limit > MAX_PAGE_LIMIT {
            return Err(ServiceError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        self.outliers
            .list(filter)
            .await
            .map_err(ServiceError::Persistence)
    }

    pub async fn get_outlier(&self, id: Uuid) -> Result<Outlier, ServiceError> {
        self.outliers
            .get(id)
            .await
            .map_err(ServiceError::Persistence)?
            .ok_or_else(|| ServiceError::NotFound(format!("outlier {}", id)))
    }

    pub async fn acknowledge(
        &self,
        identity: &Identity,
        id: Uuid,
        notes: Option<String>,
    ) -> Result<Outlier, ServiceError> {
        let path = format!("/api/v1/outliers/{}/acknowledge", id);
        let resource = id.to_string();
        self.authorize(
            identity,
            Permission::WriteOutliers,
            "outlier.acknowledge",
            &resource,
            &path,
        )
        .await?;

        let acknowledged = self
            .outliers
            .acknowledge(id, &identity.user_id, notes.as_deref(), Utc::now())
            .await
            .map_err(ServiceError::Persistence)?;
        let status = if acknowledged.is_some() { 200 } else { 404 };

        self.audit
            .log(
                identity
                    .event("outlier.acknowledge", resource)
                    .request("POST", path)
                    .status(status)
                    .details(json!({ "notes": notes })),
            )
            .await?;

        let outlier = acknowledged.ok_or_else(|| ServiceError::NotFound(format!("outlier {}", id)))?;
        tracing::info!(
            outlier_id = %id,
            user_id = %identity.user_id,
            "Outlier acknowledged"
        );
        Ok(outlier)
    }

    pub async fn statistics(&self) -> Result<OutlierSummary, ServiceError> {
        self.outliers
            .summary()
            .await
            .map_err(ServiceError::Persistence)
    }

    /// Daily counts for the last `days` days.
    pub async fn trends(&self, days: u32) -> Result<Vec<TrendPoint>, ServiceError> {
        if days == 0 || days > MAX_TREND_DAYS {
            return Err(ServiceError::InvalidInput(format!(
                "days must be between 1 and {}",
                MAX_TREND_DAYS
            )));
        }
        let since = Utc::now() - Duration::days(i64::from(days));
        self.outliers
            .trends(since)
            .await
            .map_err(ServiceError::Persistence)
    }

    // ============================================================
    // Graph queries
    // ============================================================

    pub fn node(&self, address: &str) -> Result<NodeInfo, ServiceError> {
        self.graph.get_node(address).map_err(|e| match e {
            GraphError::NotFound(address) => ServiceError::NotFound(format!("address {}", address)),
            other => ServiceError::Graph(other),
        })
    }

    pub fn window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, ServiceError> {
        Ok(self.graph.get_window(start, end, limit)?)
    }

    pub fn neighbors(&self, address: &str, direction: Direction) -> BTreeSet<String> {
        self.graph.get_neighbors(address, direction)
    }

    pub fn paths(&self, from: &str, to: &str, max_depth: usize) -> Result<Vec<Path>, ServiceError> {
        if max_depth == 0 || max_depth > MAX_PATH_DEPTH {
            return Err(ServiceError::InvalidInput(format!(
                "max_depth must be between 1 and {}",
                MAX_PATH_DEPTH
            )));
        }
        Ok(self.graph.find_paths(from, to, max_depth))
    }

    pub fn graph_statistics(&self) -> GraphStatistics {
        self.graph.get_statistics()
    }

    pub async fn snapshot(&self, identity: &Identity, name: &str) -> Result<PathBuf, ServiceError> {
        let path = "/api/v1/graph/snapshot";
        self.authorize(identity, Permission::AdminGraph, "graph.snapshot", name, path)
            .await?;

        let graph = self.graph.clone();
        let snapshot_name = name.to_string();
        let result = tokio::task::spawn_blocking(move || graph.snapshot(&snapshot_name))
            .await
            .map_err(|e| ServiceError::Persistence(eyre::eyre!("Snapshot task failed: {}", e)))?;

        let (status, details) = match &result {
            Ok(file) => (200, json!({ "file": file.display().to_string() })),
            Err(e) => (500, json!({ "error": e.to_string() })),
        };
        self.audit
            .log(
                identity
                    .event("graph.snapshot", name)
                    .request("POST", path)
                    .status(status)
                    .details(details),
            )
            .await?;
        Ok(result?)
    }

    pub async fn clear(&self, identity: &Identity) -> Result<(), ServiceError> {
        let path = "/api/v1/graph";
        self.authorize(identity, Permission::AdminGraph, "graph.clear", "graph", path)
            .await?;

        let before = self.graph.get_statistics();
        let result = self.graph.clear();
        let status = match &result {
            Ok(()) => 200,
            Err(GraphError::ClearForbidden) => 403,
            Err(_) => 500,
        };
        self.audit
            .log(
                identity
                    .event("graph.clear", "graph")
                    .request("DELETE", path)
                    .status(status)
                    .details(json!({
                        "node_count": before.node_count,
                        "edge_count": before.edge_count,
                    })),
            )
            .await?;
        Ok(result?)
    }

    // ============================================================
    // Detection
    // ============================================================

    pub async fn trigger_detection(&self, identity: &Identity) -> Result<RunReport, ServiceError> {
        let path = "/api/v1/detection/run";
        self.authorize(
            identity,
            Permission::TriggerDetection,
            "detection.trigger",
            "detection",
            path,
        )
        .await?;

        tracing::info!(user_id = %identity.user_id, "Detection run triggered on demand");
        let result = self.orchestrator.run_once(&self.shutdown).await;
        let (status, details) = match &result {
            Ok(report) => (200, json!({ "run_id": report.run_id, "outliers_new": report.outliers_new })),
            Err(RunError::AlreadyRunning) => (409, json!({ "error": "already running" })),
            Err(e) => (500, json!({ "error": e.to_string() })),
        };
        self.audit
            .log(
                identity
                    .event("detection.trigger", "detection")
                    .request("POST", path)
                    .status(status)
                    .details(details),
            )
            .await?;
        Ok(result?)
    }
}
