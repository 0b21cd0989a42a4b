use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::GraphConfig;
use crate::error::GraphError;
use crate::types::Transaction;

use super::paths::{breadth_first_paths, Path, PathQuery};
use super::snapshot;

/// Aggregate state for one address, derived from every transfer touching it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub tx_count: u64,
    pub sent_count: u64,
    pub received_count: u64,
    pub total_sent: BigDecimal,
    pub total_received: BigDecimal,
    pub balance_flow: BigDecimal,
}

impl NodeInfo {
    fn empty(address: &str, seen: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            first_seen: seen,
            last_seen: seen,
            tx_count: 0,
            sent_count: 0,
            received_count: 0,
            total_sent: BigDecimal::from(0),
            total_received: BigDecimal::from(0),
            balance_flow: BigDecimal::from(0),
        }
    }

    /// Fold one transfer into the aggregate. A self-transfer is both sent and received.
    fn record(&mut self, tx: &Transaction, sent: bool, received: bool) {
        if tx.timestamp < self.first_seen {
            self.first_seen = tx.timestamp;
        }
        if tx.timestamp > self.last_seen {
            self.last_seen = tx.timestamp;
        }
        self.tx_count += 1;
        if sent {
            self.sent_count += 1;
            self.total_sent += &tx.amount;
        }
        if received {
            self.received_count += 1;
            self.total_received += &tx.amount;
        }
        self.balance_flow = &self.total_received - &self.total_sent;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Senders to the address.
    In,
    /// Recipients from the address.
    Out,
    Both,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStatistics {
    pub node_count: usize,
    pub edge_count: usize,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub persistent: bool,
}

/// Edge set and its indices. Only touched under the graph's RwLock.
#[derive(Default)]
struct EdgeSet {
    by_hash: HashMap<String, Arc<Transaction>>,
    /// (timestamp, ingestion sequence) keeps equal timestamps in arrival order.
    by_time: BTreeMap<(DateTime<Utc>, u64), Arc<Transaction>>,
    outgoing: HashMap<String, Vec<Arc<Transaction>>>,
    incoming: HashMap<String, Vec<Arc<Transaction>>>,
    next_seq: u64,
}

impl EdgeSet {
    fn insert(&mut self, tx: Arc<Transaction>) {
        self.by_hash.insert(tx.tx_hash.clone(), tx.clone());
        self.by_time.insert((tx.timestamp, self.next_seq), tx.clone());
        self.next_seq += 1;
        self.outgoing
            .entry(tx.from.clone())
            .or_default()
            .push(tx.clone());
        self.incoming.entry(tx.to.clone()).or_default().push(tx);
    }

    fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl DoubleEndedIterator<Item = &Arc<Transaction>> {
        self.by_time
            .range((start, 0)..=(end, u64::MAX))
            .map(|(_, tx)| tx)
    }
}

/// In-memory temporal transaction graph.
///
/// Node aggregates live in a sharded map so a reader of one address never waits on
/// writers of another, and never observes a half-applied transfer. The edge set is
/// guarded by a single RwLock held only for the duration of one insert or query.
pub struct TemporalGraph {
    config: GraphConfig,
    nodes: DashMap<String, NodeInfo>,
    edges: RwLock<EdgeSet>,
    edge_count: AtomicUsize,
}

impl TemporalGraph {
    pub fn new(config: GraphConfig) -> Self {
        if config.persistent {
            tracing::info!(snapshot_dir = %config.snapshot_dir, "Initialized persistent graph");
        } else {
            tracing::info!("Initialized in-memory graph");
        }
        Self {
            config,
            nodes: DashMap::new(),
            edges: RwLock::new(EdgeSet::default()),
            edge_count: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Add a transfer to the graph. Returns `Ok(false)` if the hash is already known.
    pub fn add_transaction(&self, tx: Transaction) -> Result<bool, GraphError> {
        validate_transaction(&tx)?;
        let tx = Arc::new(tx);

        let mut edges = self.edges.write();
        if edges.by_hash.contains_key(&tx.tx_hash) {
            tracing::debug!(tx_hash = %tx.tx_hash, "Duplicate transaction ignored");
            return Ok(false);
        }
        edges.insert(tx.clone());

        // Aggregates are updated inside each address's shard lock while the edge
        // lock is still held, so node state and edge set move together.
        if tx.from == tx.to {
            self.touch_node(&tx.from, &tx, true, true);
        } else {
            self.touch_node(&tx.from, &tx, true, false);
            self.touch_node(&tx.to, &tx, false, true);
        }
        drop(edges);

        self.edge_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            tx_hash = %tx.tx_hash,
            from = %tx.from,
            to = %tx.to,
            amount = %tx.amount,
            "Transaction added to graph"
        );
        Ok(true)
    }

    fn touch_node(&self, address: &str, tx: &Transaction, sent: bool, received: bool) {
        let mut node = self
            .nodes
            .entry(address.to_string())
            .or_insert_with(|| NodeInfo::empty(address, tx.timestamp));
        node.record(tx, sent, received);
    }

    pub fn get_node(&self, address: &str) -> Result<NodeInfo, GraphError> {
        self.nodes
            .get(address)
            .map(|node| node.value().clone())
            .ok_or_else(|| GraphError::NotFound(address.to_string()))
    }

    /// Transfers with `start <= timestamp <= end`, oldest first, at most `limit`.
    pub fn get_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, GraphError> {
        if end < start {
            return Err(GraphError::InvalidRange { start, end });
        }
        let edges = self.edges.read();
        Ok(edges
            .range(start, end)
            .take(limit)
            .map(|tx| Transaction::clone(tx))
            .collect())
    }

    /// The newest `limit` transfers with `start <= timestamp <= end`, oldest first.
    pub fn get_latest_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, GraphError> {
        if end < start {
            return Err(GraphError::InvalidRange { start, end });
        }
        let edges = self.edges.read();
        let mut latest: Vec<Transaction> = edges
            .range(start, end)
            .rev()
            .take(limit)
            .map(|tx| Transaction::clone(tx))
            .collect();
        latest.reverse();
        Ok(latest)
    }

    /// Distinct addresses appearing as sender or recipient within the window.
    pub fn active_addresses(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<String>, GraphError> {
        if end < start {
            return Err(GraphError::InvalidRange { start, end });
        }
        let edges = self.edges.read();
        let mut addresses = BTreeSet::new();
        for tx in edges.range(start, end) {
            addresses.insert(tx.from.clone());
            addresses.insert(tx.to.clone());
        }
        Ok(addresses)
    }

    pub fn get_neighbors(&self, address: &str, direction: Direction) -> BTreeSet<String> {
        let edges = self.edges.read();
        let mut neighbors = BTreeSet::new();

        if matches!(direction, Direction::Out | Direction::Both) {
            if let Some(out) = edges.outgoing.get(address) {
                neighbors.extend(out.iter().map(|tx| tx.to.clone()));
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            if let Some(inc) = edges.incoming.get(address) {
                neighbors.extend(inc.iter().map(|tx| tx.from.clone()));
            }
        }
        neighbors
    }

    /// Full transfer history of one address, oldest first.
    pub fn get_address_transactions(
        &self,
        address: &str,
        direction: Direction,
    ) -> Vec<Transaction> {
        let edges = self.edges.read();
        let mut history: Vec<&Arc<Transaction>> = Vec::new();

        if matches!(direction, Direction::Out | Direction::Both) {
            if let Some(out) = edges.outgoing.get(address) {
                history.extend(out.iter());
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            if let Some(inc) = edges.incoming.get(address) {
                // Self-transfers are already present from the outgoing side.
                history.extend(
                    inc.iter()
                        .filter(|tx| direction != Direction::Both || tx.from != tx.to),
                );
            }
        }

        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        history.into_iter().map(|tx| Transaction::clone(tx)).collect()
    }

    /// Paths from `from` to `to` of at most `max_depth` hops, shortest first.
    pub fn find_paths(&self, from: &str, to: &str, max_depth: usize) -> Vec<Path> {
        self.search_paths(from, to, max_depth, None)
    }

    /// Like `find_paths`, restricted to edges inside `[start, end]` whose timestamps
    /// never decrease along the path.
    pub fn find_paths_in_range(
        &self,
        from: &str,
        to: &str,
        max_depth: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Path>, GraphError> {
        if end < start {
            return Err(GraphError::InvalidRange { start, end });
        }
        Ok(self.search_paths(from, to, max_depth, Some((start, end))))
    }

    fn search_paths(
        &self,
        from: &str,
        to: &str,
        max_depth: usize,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Vec<Path> {
        let query = PathQuery {
            from,
            to,
            max_depth,
            max_paths: self.config.max_paths,
            max_branches: self.config.max_path_branches,
            range,
        };
        let edges = self.edges.read();
        breadth_first_paths(&edges.outgoing, &query)
    }

    pub fn get_statistics(&self) -> GraphStatistics {
        let time_range = {
            let edges = self.edges.read();
            match (edges.by_time.keys().next(), edges.by_time.keys().next_back()) {
                (Some((first, _)), Some((last, _))) => Some((*first, *last)),
                _ => None,
            }
        };
        GraphStatistics {
            node_count: self.nodes.len(),
            edge_count: self.edge_count.load(Ordering::Relaxed),
            time_range,
            persistent: self.config.persistent,
        }
    }

    /// Every transfer in timestamp order.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        let edges = self.edges.read();
        edges
            .by_time
            .values()
            .map(|tx| Transaction::clone(tx))
            .collect()
    }

    /// Write the edge set to `<snapshot_dir>/<name>.json`.
    pub fn snapshot(&self, name: &str) -> Result<PathBuf, GraphError> {
        if !self.config.persistent {
            tracing::warn!("Cannot save snapshot for non-persistent graph");
            return Err(GraphError::SnapshotUnsupported);
        }
        let transactions = self.all_transactions();
        let path = snapshot::write(&self.config.snapshot_dir, name, &transactions)?;
        tracing::info!(
            path = %path.display(),
            transactions = transactions.len(),
            "Graph snapshot saved"
        );
        Ok(path)
    }

    /// Replay a snapshot file into the graph. Returns the number of new transfers.
    pub fn restore(&self, path: &std::path::Path) -> Result<usize, GraphError> {
        let transactions = snapshot::read(path)?;
        let mut added = 0;
        for tx in transactions {
            if self.add_transaction(tx)? {
                added += 1;
            }
        }
        tracing::info!(path = %path.display(), added, "Graph snapshot restored");
        Ok(added)
    }

    /// Drop every node and edge. Refused unless `allow_clear` is configured.
    pub fn clear(&self) -> Result<(), GraphError> {
        if !self.config.allow_clear {
            return Err(GraphError::ClearForbidden);
        }
        let mut edges = self.edges.write();
        *edges = EdgeSet::default();
        self.nodes.clear();
        self.edge_count.store(0, Ordering::Relaxed);
        drop(edges);

        tracing::info!("Graph cleared");
        Ok(())
    }
}

fn validate_transaction(tx: &Transaction) -> Result<(), GraphError> {
    if tx.tx_hash.trim().is_empty() {
        return Err(GraphError::InvalidTransaction("empty tx_hash".to_string()));
    }
    if tx.from.trim().is_empty() || tx.to.trim().is_empty() {
        return Err(GraphError::InvalidTransaction(format!(
            "{}: missing sender or recipient",
            tx.tx_hash
        )));
    }
    if tx.amount < BigDecimal::from(0) {
        return Err(GraphError::InvalidTransaction(format!(
            "{}: negative amount {}",
            tx.tx_hash, tx.amount
        )));
    }
    if tx.timestamp.timestamp() == 0 && tx.timestamp.timestamp_subsec_nanos() == 0 {
        return Err(GraphError::InvalidTransaction(format!(
            "{}: zero timestamp",
            tx.tx_hash
        )));
    }
    Ok(())
}
