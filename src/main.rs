use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stablerisk::audit::{AuditEvent, AuditTrail};
use stablerisk::config::{Config, LoggingConfig};
use stablerisk::db::{OutlierStore, PgAuditSink, PgOutlierStore};
use stablerisk::detection::Orchestrator;
use stablerisk::graph::TemporalGraph;
use stablerisk::ingest::run_feed;

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    init_tracing(&config.logging);
    tracing::info!(config = %config_path, "StableRisk monitor starting");

    // Create database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    tracing::info!("Connected to PostgreSQL");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    tracing::info!("Database migrations complete");

    // Audit trail resumes from the last persisted entry and must verify before we append
    let audit = Arc::new(
        AuditTrail::open(&config.audit.hmac_key, Arc::new(PgAuditSink::new(pool.clone())))
            .await?,
    );
    audit.verify_or_alarm().await?;

    // Temporal graph, optionally warmed from a snapshot
    let graph = Arc::new(TemporalGraph::new(config.graph.clone()));
    if let Some(path) = &config.graph.restore_from {
        let graph = graph.clone();
        let path = std::path::PathBuf::from(path);
        let restored = tokio::task::spawn_blocking(move || graph.restore(&path)).await??;
        tracing::info!(restored, "Graph restored from snapshot");
    }

    let outliers: Arc<dyn OutlierStore> = Arc::new(PgOutlierStore::new(pool.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        config.detection.clone(),
        graph.clone(),
        outliers,
        audit.clone(),
    ));

    audit
        .log(AuditEvent::system("service.start", "stablerisk-monitor"))
        .await?;

    // Create shutdown signal
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    // Forward new outliers to the log
    let mut alerts = orchestrator.subscribe();
    let alert_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = alerts.recv() => match received {
                    Ok(outlier) => tracing::warn!(
                        outlier_id = %outlier.id,
                        outlier_type = outlier.outlier_type.as_str(),
                        severity = outlier.severity.as_str(),
                        address = %outlier.address,
                        tx_hash = outlier.transaction_hash.as_deref().unwrap_or("-"),
                        "OUTLIER DETECTED"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Alert subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = alert_shutdown.cancelled() => break,
            }
        }
    }));

    // Periodic detection
    handles.push(tokio::spawn(orchestrator.clone().run_loop(shutdown.clone())));

    // Transaction feed on stdin (NDJSON)
    {
        let graph = graph.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_feed(BufReader::new(tokio::io::stdin()), graph, shutdown).await {
                tracing::error!(error = %e, "Transaction feed failed");
            }
        }));
    }

    tracing::info!("Monitor running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping...");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    if config.graph.persistent {
        let graph = graph.clone();
        match tokio::task::spawn_blocking(move || graph.snapshot("")).await? {
            Ok(path) => tracing::info!(path = %path.display(), "Shutdown snapshot written"),
            Err(e) => tracing::error!(error = %e, "Failed to write shutdown snapshot"),
        }
    }

    audit
        .log(AuditEvent::system("service.stop", "stablerisk-monitor"))
        .await?;

    tracing::info!("StableRisk monitor stopped gracefully");
    Ok(())
}
