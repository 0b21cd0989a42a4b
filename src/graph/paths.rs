use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Transaction;

/// An ordered chain of transfers leading from one address to another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Path {
    pub transactions: Vec<Transaction>,
}

impl Path {
    pub fn hops(&self) -> usize {
        self.transactions.len()
    }

    /// Addresses visited along the path, origin first.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses = Vec::with_capacity(self.transactions.len() + 1);
        if let Some(first) = self.transactions.first() {
            addresses.push(first.from.clone());
        }
        addresses.extend(self.transactions.iter().map(|tx| tx.to.clone()));
        addresses
    }

    pub fn tx_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.tx_hash.clone()).collect()
    }

    pub fn total_amount(&self) -> BigDecimal {
        self.transactions
            .iter()
            .fold(BigDecimal::from(0), |acc, tx| acc + &tx.amount)
    }
}

/// Parameters of a bounded path search.
#[derive(Debug, Clone)]
pub struct PathQuery<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub max_depth: usize,
    pub max_paths: usize,
    pub max_branches: usize,
    /// Only follow edges inside this range, with non-decreasing timestamps along the path.
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

struct Branch<'g> {
    hops: Vec<&'g Arc<Transaction>>,
    visited: HashSet<&'g str>,
}

/// Breadth-first enumeration of paths over the outgoing adjacency lists.
///
/// Shorter paths are returned first. Each branch carries its own visited set, so an
/// address appears at most once per path; the origin may only reappear as the final
/// hop when `from == to`.
pub(crate) fn breadth_first_paths(
    outgoing: &HashMap<String, Vec<Arc<Transaction>>>,
    query: &PathQuery<'_>,
) -> Vec<Path> {
    let mut paths = Vec::new();
    if query.max_depth == 0 || query.max_paths == 0 {
        return paths;
    }

    let Some((origin, _)) = outgoing.get_key_value(query.from) else {
        return paths;
    };

    let mut queue = VecDeque::new();
    let mut branches = 1usize;
    queue.push_back(Branch {
        hops: Vec::new(),
        visited: HashSet::from([origin.as_str()]),
    });

    while let Some(branch) = queue.pop_front() {
        if branch.hops.len() >= query.max_depth {
            continue;
        }

        let current = branch
            .hops
            .last()
            .map(|tx| tx.to.as_str())
            .unwrap_or(query.from);
        let Some(edges) = outgoing.get(current) else {
            continue;
        };

        for tx in edges {
            if let Some((start, end)) = query.range {
                if tx.timestamp < start || tx.timestamp > end {
                    continue;
                }
                if branch.hops.last().is_some_and(|prev| tx.timestamp < prev.timestamp) {
                    continue;
                }
            }

            if tx.to == query.to {
                let mut hops: Vec<Transaction> =
                    branch.hops.iter().map(|t| Transaction::clone(t)).collect();
                hops.push(Transaction::clone(tx));
                paths.push(Path { transactions: hops });
                if paths.len() >= query.max_paths {
                    return paths;
                }
                continue;
            }

            if branch.visited.contains(tx.to.as_str()) || branches >= query.max_branches {
                continue;
            }

            let mut hops = branch.hops.clone();
            hops.push(tx);
            let mut visited = branch.visited.clone();
            visited.insert(tx.to.as_str());
            queue.push_back(Branch { hops, visited });
            branches += 1;
        }
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tx(hash: &str, from: &str, to: &str, amount: i64, secs: i64) -> Arc<Transaction> {
        Arc::new(Transaction {
            tx_hash: hash.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            amount: BigDecimal::from(amount),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            block_number: secs as u64,
            contract: String::new(),
            confirmed: true,
        })
    }

    fn adjacency(txs: &[Arc<Transaction>]) -> HashMap<String, Vec<Arc<Transaction>>> {
        let mut out: HashMap<String, Vec<Arc<Transaction>>> = HashMap::new();
        for t in txs {
            out.entry(t.from.clone()).or_default().push(t.clone());
        }
        out
    }

    fn query<'a>(from: &'a str, to: &'a str, max_depth: usize) -> PathQuery<'a> {
        PathQuery {
            from,
            to,
            max_depth,
            max_paths: 100,
            max_branches: 10_000,
            range: None,
        }
    }

    #[test]
    fn test_shorter_paths_first() {
        let out = adjacency(&[
            tx("1", "A", "B", 10, 1),
            tx("2", "B", "C", 10, 2),
            tx("3", "C", "D", 10, 3),
            tx("4", "A", "D", 10, 4),
        ]);
        let paths = breadth_first_paths(&out, &query("A", "D", 3));
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].tx_hashes(), vec!["4"]);
        assert_eq!(paths[1].tx_hashes(), vec!["1", "2", "3"]);
        assert_eq!(paths[1].addresses(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_depth_bound_excludes_long_paths() {
        let out = adjacency(&[
            tx("1", "A", "B", 10, 1),
            tx("2", "B", "C", 10, 2),
            tx("3", "C", "D", 10, 3),
        ]);
        assert!(breadth_first_paths(&out, &query("A", "D", 2)).is_empty());
        assert_eq!(breadth_first_paths(&out, &query("A", "D", 3)).len(), 1);
    }

    #[test]
    fn test_cycle_does_not_loop_forever() {
        let out = adjacency(&[
            tx("1", "A", "B", 10, 1),
            tx("2", "B", "A", 10, 2),
            tx("3", "B", "C", 10, 3),
            tx("4", "C", "B", 10, 4),
        ]);
        // No path to Z; the search terminates despite the cycles.
        assert!(breadth_first_paths(&out, &query("A", "Z", 10)).is_empty());
    }

    #[test]
    fn test_range_requires_time_ordered_hops() {
        let out = adjacency(&[
            tx("1", "A", "B", 10, 10),
            tx("2", "B", "C", 10, 5),
            tx("3", "C", "A", 10, 20),
        ]);
        let mut q = query("A", "A", 5);
        assert_eq!(breadth_first_paths(&out, &q).len(), 1);

        q.range = Some((
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
        ));
        assert!(breadth_first_paths(&out, &q).is_empty());
    }

    #[test]
    fn test_max_paths_caps_parallel_edges() {
        let mut txs = Vec::new();
        for i in 0..20 {
            txs.push(tx(&format!("p{}", i), "A", "B", 1, i));
        }
        let out = adjacency(&txs);
        let mut q = query("A", "B", 1);
        q.max_paths = 5;
        assert_eq!(breadth_first_paths(&out, &q).len(), 5);
    }
}
