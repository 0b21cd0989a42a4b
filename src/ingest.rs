use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use crate::graph::TemporalGraph;
use crate::types::Transaction;

/// Counters for one ingestion session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub added: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Feed newline-delimited JSON transactions from `reader` into the graph until EOF or
/// shutdown. Malformed or invalid lines are logged and skipped.
pub async fn run_feed<R>(
    reader: R,
    graph: Arc<TemporalGraph>,
    shutdown: CancellationToken,
) -> eyre::Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.cancelled() => break,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines += 1;

        let tx: Transaction = match serde_json::from_str(line) {
            Ok(tx) => tx,
            Err(e) => {
                stats.rejected += 1;
                tracing::warn!(line = stats.lines, error = %e, "Skipping malformed transaction");
                continue;
            }
        };

        match graph.add_transaction(tx) {
            Ok(true) => stats.added += 1,
            Ok(false) => stats.duplicates += 1,
            Err(e) => {
                stats.rejected += 1;
                tracing::warn!(line = stats.lines, error = %e, "Rejected transaction");
            }
        }

        if stats.lines % 10_000 == 0 {
            tracing::info!(
                lines = stats.lines,
                added = stats.added,
                duplicates = stats.duplicates,
                rejected = stats.rejected,
                "Ingestion progress"
            );
        }
    }

    tracing::info!(
        lines = stats.lines,
        added = stats.added,
        duplicates = stats.duplicates,
        rejected = stats.rejected,
        "Transaction feed ended"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;

    #[tokio::test]
    async fn test_feed_counts_outcomes() {
        let feed = concat!(
            r#"{"tx_hash":"0x1","from":"TA","to":"TB","amount":"100.50","timestamp":"2024-05-01T12:00:00Z","block_number":1}"#,
            "\n",
            r#"{"tx_hash":"0x1","from":"TA","to":"TB","amount":"100.50","timestamp":"2024-05-01T12:00:00Z","block_number":1}"#,
            "\n\n",
            "not json\n",
            r#"{"tx_hash":"0x2","from":"TA","to":"TC","amount":"-3","timestamp":"2024-05-01T12:01:00Z","block_number":2}"#,
            "\n",
            r#"{"tx_hash":"0x3","from":"TB","to":"TC","amount":"7","timestamp":"2024-05-01T12:02:00Z","block_number":3,"confirmed":true}"#,
            "\n",
        );
        let graph = Arc::new(TemporalGraph::new(GraphConfig::default()));
        let stats = run_feed(feed.as_bytes(), graph.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            IngestStats {
                lines: 5,
                added: 2,
                duplicates: 1,
                rejected: 2,
            }
        );
        assert_eq!(graph.get_statistics().edge_count, 2);
    }

    #[tokio::test]
    async fn test_feed_stops_on_shutdown() {
        let (_writer, reader) = tokio::io::duplex(64);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let graph = Arc::new(TemporalGraph::new(GraphConfig::default()));
        let stats = run_feed(tokio::io::BufReader::new(reader), graph, shutdown)
            .await
            .unwrap();
        assert_eq!(stats.lines, 0);
    }
}
