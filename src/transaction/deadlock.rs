// Deadlock detection.
//
// A dedicated background thread periodically rebuilds the waits-for graph
// from the lock manager's request queues and runs DFS cycle detection. On
// each cycle found, the youngest transaction (largest id) is marked as the
// victim and every queue it waits in is signalled; the sweep repeats until
// the graph is acyclic.

use crate::common::TransactionId;
use crate::transaction::lock_manager::LockManager;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Detection statistics.
#[derive(Debug, Default, Clone)]
pub struct DeadlockStats {
    pub detection_runs: u64,
    pub deadlocks_found: u64,
    pub victims_aborted: u64,
    pub max_cycle_length: usize,
}

/// Background deadlock detector.
pub struct DeadlockDetector {
    interval: Duration,
    stats: Arc<Mutex<DeadlockStats>>,
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    /// Spawns the detector thread.
    pub fn start(lock_manager: Arc<LockManager>, interval: Duration) -> Self {
        let (shutdown, rx) = bounded::<()>(1);
        let stats = Arc::new(Mutex::new(DeadlockStats::default()));
        let thread_stats = stats.clone();
        let handle = std::thread::Builder::new()
            .name("latticedb-deadlock".to_string())
            .spawn(move || Self::run(lock_manager, rx, interval, thread_stats))
            .expect("failed to spawn deadlock detector");
        Self {
            interval,
            stats,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.lock().clone()
    }

    fn run(
        lock_manager: Arc<LockManager>,
        shutdown: Receiver<()>,
        interval: Duration,
        stats: Arc<Mutex<DeadlockStats>>,
    ) {
        loop {
            match shutdown.recv_timeout(interval) {
                Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            }
            Self::sweep(&lock_manager, &stats);
        }
    }

    /// One detection pass: resolve every reachable cycle.
    pub fn sweep(lock_manager: &LockManager, stats: &Mutex<DeadlockStats>) {
        stats.lock().detection_runs += 1;
        loop {
            let graph = build_graph(lock_manager.waits_for_edges());
            let Some(cycle) = find_cycle(&graph) else {
                break;
            };
            let victim = select_victim(&cycle);
            tracing::warn!(
                victim,
                cycle = ?cycle,
                "deadlock detected, aborting youngest transaction"
            );
            {
                let mut s = stats.lock();
                s.deadlocks_found += 1;
                s.victims_aborted += 1;
                s.max_cycle_length = s.max_cycle_length.max(cycle.len());
            }
            lock_manager.mark_victim(victim);
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn build_graph(
    edges: Vec<(TransactionId, TransactionId)>,
) -> HashMap<TransactionId, HashSet<TransactionId>> {
    let mut graph: HashMap<TransactionId, HashSet<TransactionId>> = HashMap::new();
    for (waiter, holder) in edges {
        if waiter != holder {
            graph.entry(waiter).or_default().insert(holder);
        }
    }
    graph
}

/// DFS cycle detection; returns the transactions on the first cycle found.
fn find_cycle(graph: &HashMap<TransactionId, HashSet<TransactionId>>) -> Option<Vec<TransactionId>> {
    let mut visited = HashSet::new();
    for &start in graph.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = dfs(start, graph, &mut visited, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn dfs(
    node: TransactionId,
    graph: &HashMap<TransactionId, HashSet<TransactionId>>,
    visited: &mut HashSet<TransactionId>,
    path: &mut Vec<TransactionId>,
) -> Option<Vec<TransactionId>> {
    if let Some(pos) = path.iter().position(|&t| t == node) {
        return Some(path[pos..].to_vec());
    }
    if visited.contains(&node) {
        return None;
    }
    visited.insert(node);
    path.push(node);
    if let Some(next) = graph.get(&node) {
        for &n in next {
            if let Some(cycle) = dfs(n, graph, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    None
}

/// The youngest transaction (largest id) on the cycle is sacrificed.
fn select_victim(cycle: &[TransactionId]) -> TransactionId {
    *cycle.iter().max().expect("cycle cannot be empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(edges: &[(TransactionId, TransactionId)]) -> HashMap<TransactionId, HashSet<TransactionId>> {
        build_graph(edges.to_vec())
    }

    #[test]
    fn test_simple_cycle_detection() {
        let graph = graph_of(&[(1, 2), (2, 3), (3, 1)]);
        let cycle = find_cycle(&graph).unwrap();
        assert_eq!(cycle.len(), 3);
        assert!(cycle.contains(&1));
        assert!(cycle.contains(&2));
        assert!(cycle.contains(&3));
    }

    #[test]
    fn test_no_cycle() {
        let graph = graph_of(&[(1, 2), (2, 3), (1, 3)]);
        assert!(find_cycle(&graph).is_none());
    }

    #[test]
    fn test_self_edges_ignored() {
        let graph = graph_of(&[(1, 1)]);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_victim_is_youngest() {
        assert_eq!(select_victim(&[1, 5, 3, 2]), 5);
    }

    #[test]
    fn test_cycle_slice_excludes_tail() {
        // 9 -> 1 -> 2 -> 1: the cycle is (1, 2), not including 9.
        let graph = graph_of(&[(9, 1), (1, 2), (2, 1)]);
        let cycle = find_cycle(&graph).unwrap();
        assert!(cycle.contains(&1) && cycle.contains(&2));
        assert!(!cycle.contains(&9) || cycle.len() == 2);
    }
}
