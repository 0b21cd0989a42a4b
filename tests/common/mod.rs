#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, TimeZone, Utc};

use stablerisk::audit::{AuditTrail, MemoryAuditSink};
use stablerisk::config::{DetectionConfig, GraphConfig};
use stablerisk::db::MemoryOutlierStore;
use stablerisk::detection::Orchestrator;
use stablerisk::graph::TemporalGraph;
use stablerisk::types::Transaction;

pub const WHALE_TX: &str = "0xwhale";

pub fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_007_200, 0).unwrap()
}

pub fn tx(hash: &str, from: &str, to: &str, amount: &str, at: DateTime<Utc>) -> Transaction {
    Transaction {
        tx_hash: hash.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        amount: BigDecimal::from_str(amount).unwrap(),
        timestamp: at,
        block_number: at.timestamp() as u64,
        contract: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
        confirmed: true,
    }
}

/// Forty ordinary transfers between distinct pairs plus one very large one.
pub fn ordinary_day_with_whale() -> Vec<Transaction> {
    let mut txs: Vec<Transaction> = (0..40)
        .map(|i| {
            tx(
                &format!("0x{:04}", i),
                &format!("TSender{}", i),
                &format!("TRecipient{}", i),
                &format!("{}", 100 + i % 5),
                now() - Duration::seconds(3_000 - i as i64 * 10),
            )
        })
        .collect();
    txs.push(tx(
        WHALE_TX,
        "TWhale",
        "TDestination",
        "10000",
        now() - Duration::seconds(600),
    ));
    txs
}

pub struct Harness {
    pub graph: Arc<TemporalGraph>,
    pub store: Arc<MemoryOutlierStore>,
    pub sink: Arc<MemoryAuditSink>,
    pub audit: Arc<AuditTrail>,
}

impl Harness {
    pub async fn new(graph_config: GraphConfig) -> Self {
        let graph = Arc::new(TemporalGraph::new(graph_config));
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = Arc::new(AuditTrail::open("integration-key", sink.clone()).await.unwrap());
        Self {
            graph,
            store: Arc::new(MemoryOutlierStore::new()),
            sink,
            audit,
        }
    }

    pub async fn with_transactions(txs: Vec<Transaction>) -> Self {
        let harness = Self::new(GraphConfig::default()).await;
        for t in txs {
            harness.graph.add_transaction(t).unwrap();
        }
        harness
    }

    pub fn orchestrator(&self, config: DetectionConfig) -> Orchestrator {
        Orchestrator::new(
            config,
            self.graph.clone(),
            self.store.clone(),
            self.audit.clone(),
        )
    }
}
