mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use stablerisk::audit::AuditSink;
use stablerisk::config::{DetectionConfig, GraphConfig};
use stablerisk::db::{OutlierFilter, OutlierStore};
use stablerisk::error::{GraphError, ServiceError};
use stablerisk::service::{Identity, MonitorService, Permission, StaticAuthorizer};
use stablerisk::types::{Outlier, OutlierDetails, OutlierType, Severity};

use common::{ordinary_day_with_whale, tx, Harness};

const ANALYST: &str = "analyst";
const VIEWER: &str = "viewer";
const ADMIN: &str = "admin";

fn service(harness: &Harness) -> MonitorService {
    let orchestrator = Arc::new(harness.orchestrator(DetectionConfig::default()));
    let authorizer = StaticAuthorizer::new()
        .grant(ANALYST, &[Permission::WriteOutliers, Permission::TriggerDetection])
        .grant(
            ADMIN,
            &[
                Permission::WriteOutliers,
                Permission::TriggerDetection,
                Permission::AdminGraph,
            ],
        );
    MonitorService::new(
        harness.graph.clone(),
        harness.store.clone(),
        orchestrator,
        harness.audit.clone(),
        Arc::new(authorizer),
        CancellationToken::new(),
    )
}

async fn seeded_outlier(harness: &Harness) -> Outlier {
    let outlier = Outlier::new(
        OutlierType::PatternVelocity,
        Severity::High,
        "TBusy",
        OutlierDetails::Velocity {
            transaction_count: 600,
            max_transactions: 100,
            window_secs: 3_600,
            per_hour: 600.0,
        },
    );
    let inserted = harness.store.insert_new(&[outlier]).await.unwrap();
    inserted.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_acknowledge_without_permission_is_denied_and_audited() {
    let harness = Harness::new(GraphConfig::default()).await;
    let service = service(&harness);
    let outlier = seeded_outlier(&harness).await;

    let result = service
        .acknowledge(&Identity::new(VIEWER), outlier.id, Some("looks fine".to_string()))
        .await;

    assert!(matches!(
        result,
        Err(ServiceError::PermissionDenied("write:outliers"))
    ));
    let stored = service.get_outlier(outlier.id).await.unwrap();
    assert!(!stored.acknowledged);
    assert!(stored.acknowledged_by.is_none());

    let entries = harness.sink.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "outlier.acknowledge");
    assert_eq!(entries[0].status_code, 403);
    assert_eq!(entries[0].user_id.as_deref(), Some(VIEWER));
    assert_eq!(entries[0].resource, outlier.id.to_string());
}

#[tokio::test]
async fn test_acknowledge_records_reviewer() {
    let harness = Harness::new(GraphConfig::default()).await;
    let service = service(&harness);
    let outlier = seeded_outlier(&harness).await;

    let acknowledged = service
        .acknowledge(&Identity::new(ANALYST), outlier.id, Some("known exchange".to_string()))
        .await
        .unwrap();

    assert!(acknowledged.acknowledged);
    assert_eq!(acknowledged.acknowledged_by.as_deref(), Some(ANALYST));
    assert_eq!(acknowledged.notes.as_deref(), Some("known exchange"));
    assert!(acknowledged.acknowledged_at.is_some());

    let entries = harness.sink.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status_code, 200);
    assert_eq!(entries[0].method, "POST");
    assert!(harness.audit.verify().await.unwrap().is_intact());
}

#[tokio::test]
async fn test_acknowledge_unknown_outlier() {
    let harness = Harness::new(GraphConfig::default()).await;
    let service = service(&harness);

    let result = service
        .acknowledge(&Identity::new(ANALYST), uuid::Uuid::new_v4(), None)
        .await;

    assert!(matches!(result, Err(ServiceError::NotFound(_))));
    let entries = harness.sink.entries().await.unwrap();
    assert_eq!(entries[0].status_code, 404);
}

#[tokio::test]
async fn test_list_rejects_bad_paging() {
    let harness = Harness::new(GraphConfig::default()).await;
    let service = service(&harness);
    seeded_outlier(&harness).await;

    let page_zero = OutlierFilter {
        page: 0,
        ..OutlierFilter::default()
    };
    assert!(matches!(
        service.list_outliers(&page_zero).await,
        Err(ServiceError::InvalidInput(_))
    ));

    let too_many = OutlierFilter {
        limit: 101,
        ..OutlierFilter::default()
    };
    assert!(matches!(
        service.list_outliers(&too_many).await,
        Err(ServiceError::InvalidInput(_))
    ));

    let page = service.list_outliers(&OutlierFilter::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.outliers.len(), 1);
}

#[tokio::test]
async fn test_trigger_detection_requires_permission() {
    let harness = Harness::with_transactions(ordinary_day_with_whale()).await;
    let service = service(&harness);

    let denied = service.trigger_detection(&Identity::new(VIEWER)).await;
    assert!(matches!(denied, Err(ServiceError::PermissionDenied(_))));
    assert!(harness.store.is_empty());

    // The fixture sits in the past; an on-demand run at the wall clock sees an empty window.
    let report = service.trigger_detection(&Identity::new(ANALYST)).await.unwrap();
    assert_eq!(report.transactions_analyzed, 0);

    let actions: Vec<(String, i32)> = harness
        .sink
        .entries()
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.action, e.status_code))
        .collect();
    assert_eq!(
        actions,
        vec![
            ("detection.trigger".to_string(), 403),
            ("detection.run".to_string(), 200),
            ("detection.trigger".to_string(), 200),
        ]
    );
}

#[tokio::test]
async fn test_clear_refused_when_not_allowed() {
    let harness = Harness::with_transactions(ordinary_day_with_whale()).await;
    let service = service(&harness);

    let result = service.clear(&Identity::new(ADMIN)).await;

    assert!(matches!(
        result,
        Err(ServiceError::Graph(GraphError::ClearForbidden))
    ));
    assert_eq!(service.graph_statistics().edge_count, 41);
    let entries = harness.sink.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "graph.clear");
    assert_eq!(entries[0].status_code, 403);
}

#[tokio::test]
async fn test_clear_and_snapshot_with_admin_graph() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(GraphConfig {
        persistent: true,
        allow_clear: true,
        snapshot_dir: dir.path().display().to_string(),
        ..GraphConfig::default()
    })
    .await;
    let service = service(&harness);
    for t in ordinary_day_with_whale() {
        service.ingest_transaction(t).unwrap();
    }

    assert!(matches!(
        service.snapshot(&Identity::new(ANALYST), "manual").await,
        Err(ServiceError::PermissionDenied("admin:graph"))
    ));

    let file = service
        .snapshot(&Identity::new(ADMIN), "manual")
        .await
        .unwrap();
    assert!(file.exists());

    service.clear(&Identity::new(ADMIN)).await.unwrap();
    assert_eq!(service.graph_statistics().edge_count, 0);

    assert_eq!(harness.graph.restore(&file).unwrap(), 41);
    assert!(harness.audit.verify().await.unwrap().is_intact());
    assert_eq!(harness.sink.len(), 3);
}

#[tokio::test]
async fn test_graph_queries() {
    let harness = Harness::with_transactions(vec![
        tx("0xa", "TA", "TB", "10", common::now()),
        tx("0xb", "TB", "TC", "10", common::now()),
    ])
    .await;
    let service = service(&harness);

    assert!(matches!(
        service.node("TUnknown"),
        Err(ServiceError::NotFound(_))
    ));
    assert_eq!(service.node("TB").unwrap().tx_count, 2);
    assert_eq!(service.paths("TA", "TC", 3).unwrap().len(), 1);
    assert!(matches!(
        service.paths("TA", "TC", 11),
        Err(ServiceError::InvalidInput(_))
    ));
    assert!(matches!(
        service.trends(0).await,
        Err(ServiceError::InvalidInput(_))
    ));
}
