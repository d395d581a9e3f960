//! Node registry: the fixed inventory of compute nodes and their capacity.
//!
//! Nodes live in an arena indexed by position; each record carries its own
//! mutex so reservations on different nodes never contend, while all
//! reserve/release/read-for-decision operations on one node are serialized.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use dispatch_common::{NodeInfo, NodeStatus};

use crate::config::NodeConfig;

/// Tolerance for floating point capacity arithmetic.
const CAPACITY_EPSILON: f64 = 1e-9;

/// Static description of a node, fixed at startup.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub hostname: String,
    pub url: String,
    pub total_capacity: f64,
    pub models: Vec<String>,
}

impl NodeSpec {
    fn fits(&self, model: &str, amount: f64) -> bool {
        self.models.iter().any(|m| m == model) && self.total_capacity + CAPACITY_EPSILON >= amount
    }
}

impl From<&NodeConfig> for NodeSpec {
    fn from(config: &NodeConfig) -> Self {
        Self {
            id: config.id.clone(),
            hostname: config.hostname.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            total_capacity: config.total_capacity,
            models: config.models.clone(),
        }
    }
}

#[derive(Debug)]
struct NodeState {
    used: f64,
    utilization: f64,
    status: NodeStatus,
}

#[derive(Debug)]
struct NodeRecord {
    spec: NodeSpec,
    state: Mutex<NodeState>,
}

/// Point-in-time copy of a node.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: String,
    pub hostname: String,
    pub url: String,
    pub total_capacity: f64,
    pub used_capacity: f64,
    pub compute_utilization: f64,
    pub status: NodeStatus,
    pub models: Vec<String>,
}

impl NodeSnapshot {
    pub fn free_capacity(&self) -> f64 {
        (self.total_capacity - self.used_capacity).max(0.0)
    }

    pub fn hosts(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn to_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.id.clone(),
            hostname: self.hostname.clone(),
            total_capacity: self.total_capacity,
            used_capacity: self.used_capacity,
            compute_utilization: self.compute_utilization,
            status: self.status,
            models_loaded: self.models.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node '{0}' not found")]
    NodeNotFound(String),
}

/// Registry of compute nodes.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Vec<NodeRecord>,
    index: HashMap<String, usize>,
    /// Bumped whenever capacity is freed; the queue dispatcher watches it.
    capacity_events: watch::Sender<u64>,
}

impl NodeRegistry {
    pub fn new(specs: Vec<NodeSpec>) -> Self {
        let index = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.id.clone(), i))
            .collect();
        let nodes = specs
            .into_iter()
            .map(|spec| NodeRecord {
                spec,
                state: Mutex::new(NodeState {
                    used: 0.0,
                    utilization: 0.0,
                    status: NodeStatus::Available,
                }),
            })
            .collect();
        let (capacity_events, _) = watch::channel(0);

        Self {
            nodes,
            index,
            capacity_events,
        }
    }

    pub fn from_config(nodes: &[NodeConfig]) -> Self {
        Self::new(nodes.iter().map(NodeSpec::from).collect())
    }

    fn record(&self, node_id: &str) -> Option<&NodeRecord> {
        self.index.get(node_id).map(|&i| &self.nodes[i])
    }

    /// Reserve `amount` capacity units on a node.
    ///
    /// Succeeds only if the node is available and the reservation fits;
    /// otherwise nothing is changed.
    pub fn reserve(&self, node_id: &str, amount: f64) -> bool {
        if !(amount.is_finite() && amount >= 0.0) {
            return false;
        }
        let Some(record) = self.record(node_id) else {
            return false;
        };

        let mut state = record.state.lock();
        if !state.status.accepts_work() {
            return false;
        }
        if state.used + amount > record.spec.total_capacity + CAPACITY_EPSILON {
            return false;
        }
        state.used = (state.used + amount).min(record.spec.total_capacity);
        tracing::trace!(node_id, amount, used = state.used, "reserved capacity");
        true
    }

    /// Release `amount` capacity units, flooring usage at zero.
    pub fn release(&self, node_id: &str, amount: f64) {
        self.release_inner(node_id, amount, true);
    }

    fn release_inner(&self, node_id: &str, amount: f64, notify: bool) {
        let Some(record) = self.record(node_id) else {
            tracing::warn!(node_id, "release on unknown node ignored");
            return;
        };
        {
            let mut state = record.state.lock();
            let remaining = state.used - amount.max(0.0);
            state.used = if remaining < CAPACITY_EPSILON {
                0.0
            } else {
                remaining
            };
            tracing::trace!(node_id, amount, used = state.used, "released capacity");
        }
        if notify {
            self.notify_capacity_freed();
        }
    }

    /// Reserve capacity and wrap it in a guard that releases on drop.
    pub fn try_reserve(self: &Arc<Self>, node_id: &str, amount: f64) -> Option<Reservation> {
        if self.reserve(node_id, amount) {
            Some(Reservation {
                registry: Arc::clone(self),
                node_id: node_id.to_string(),
                amount,
                released: false,
            })
        } else {
            None
        }
    }

    /// Available nodes hosting `model` with at least `min_free` units free,
    /// least utilized first (ties by node id).
    pub fn candidates(&self, model: &str, min_free: f64) -> Vec<NodeSnapshot> {
        let mut candidates: Vec<NodeSnapshot> = self
            .nodes
            .iter()
            .filter(|record| record.spec.models.iter().any(|m| m == model))
            .map(Self::snapshot_of)
            .filter(|node| {
                node.status.accepts_work() && node.free_capacity() + CAPACITY_EPSILON >= min_free
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.compute_utilization
                .total_cmp(&b.compute_utilization)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Whether any node, in any state, could ever fit `amount` units of `model`.
    pub fn could_host(&self, model: &str, amount: f64) -> bool {
        self.nodes.iter().any(|record| record.spec.fits(model, amount))
    }

    /// Number of distinct nodes, in any state, that could ever fit at least
    /// one of `demands` (model, units).
    pub fn count_hosts(&self, demands: &[(String, f64)]) -> usize {
        self.nodes
            .iter()
            .filter(|record| {
                demands
                    .iter()
                    .any(|(model, amount)| record.spec.fits(model, *amount))
            })
            .count()
    }

    pub fn get(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.record(node_id).map(Self::snapshot_of)
    }

    /// All nodes in configuration order.
    pub fn all(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(Self::snapshot_of).collect()
    }

    pub fn specs(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().map(|record| &record.spec)
    }

    pub fn available_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|record| record.state.lock().status.accepts_work())
            .count()
    }

    /// Overwrite a node's usage, utilization and status (privileged).
    ///
    /// Values are clamped to `[0, total_capacity]` and `[0, 1]`.
    pub fn update_status(
        &self,
        node_id: &str,
        used: f64,
        utilization: f64,
        status: NodeStatus,
    ) -> Result<NodeSnapshot, RegistryError> {
        let record = self
            .record(node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;

        let freed = {
            let mut state = record.state.lock();
            let before_free = state.status.accepts_work().then(|| record.spec.total_capacity - state.used);
            state.used = sanitize(used).clamp(0.0, record.spec.total_capacity);
            state.utilization = sanitize(utilization).clamp(0.0, 1.0);
            state.status = status;
            let after_free = status.accepts_work().then(|| record.spec.total_capacity - state.used);
            match (before_free, after_free) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(before), Some(after)) => after > before,
            }
        };

        tracing::info!(
            node_id,
            used,
            utilization,
            status = %status,
            "node status overwritten"
        );
        if freed {
            self.notify_capacity_freed();
        }
        Ok(Self::snapshot_of(record))
    }

    /// Subscribe to capacity-freed events.
    pub fn capacity_events(&self) -> watch::Receiver<u64> {
        self.capacity_events.subscribe()
    }

    fn notify_capacity_freed(&self) {
        self.capacity_events.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn snapshot_of(record: &NodeRecord) -> NodeSnapshot {
        let state = record.state.lock();
        NodeSnapshot {
            id: record.spec.id.clone(),
            hostname: record.spec.hostname.clone(),
            url: record.spec.url.clone(),
            total_capacity: record.spec.total_capacity,
            used_capacity: state.used,
            compute_utilization: state.utilization,
            status: state.status,
            models: record.spec.models.clone(),
        }
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Capacity held on one node. Released exactly once: explicitly, or on drop.
#[derive(Debug)]
pub struct Reservation {
    registry: Arc<NodeRegistry>,
    node_id: String,
    amount: f64,
    released: bool,
}

impl Reservation {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Release now and wake queued work.
    pub fn release(mut self) {
        self.finish(true);
    }

    /// Release without waking the dispatcher; used when a tentative
    /// reservation is abandoned during planning.
    pub fn rollback(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, notify: bool) {
        if !self.released {
            self.released = true;
            self.registry.release_inner(&self.node_id, self.amount, notify);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.finish(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, total: f64, models: &[&str]) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            hostname: format!("{}.internal", id),
            url: format!("http://{}:8080", id),
            total_capacity: total,
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn registry() -> Arc<NodeRegistry> {
        Arc::new(NodeRegistry::new(vec![
            spec("node-a", 10.0, &["reasoner", "parser"]),
            spec("node-b", 10.0, &["reasoner"]),
            spec("node-c", 4.0, &["polyglot"]),
        ]))
    }

    #[test]
    fn test_reserve_within_capacity() {
        let registry = registry();
        assert!(registry.reserve("node-a", 6.0));
        assert!(registry.reserve("node-a", 4.0));
        assert!(!registry.reserve("node-a", 0.5));
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 10.0);
    }

    #[test]
    fn test_reserve_rejects_unknown_and_invalid_amounts() {
        let registry = registry();
        assert!(!registry.reserve("nope", 1.0));
        assert!(!registry.reserve("node-a", -1.0));
        assert!(!registry.reserve("node-a", f64::NAN));
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 0.0);
    }

    #[test]
    fn test_reserve_requires_available_status() {
        let registry = registry();
        registry
            .update_status("node-b", 0.0, 0.1, NodeStatus::Degraded)
            .unwrap();
        assert!(!registry.reserve("node-b", 1.0));
        assert_eq!(registry.get("node-b").unwrap().used_capacity, 0.0);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let registry = registry();
        assert!(registry.reserve("node-a", 3.0));
        registry.release("node-a", 3.0);
        registry.release("node-a", 3.0);
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 0.0);
    }

    #[test]
    fn test_reservation_guard_releases_once() {
        let registry = registry();
        {
            let guard = registry.try_reserve("node-a", 5.0).unwrap();
            assert_eq!(guard.node_id(), "node-a");
            assert_eq!(registry.get("node-a").unwrap().used_capacity, 5.0);
            guard.release();
        }
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 0.0);

        // Another holder's capacity must survive the first guard's drop.
        let first = registry.try_reserve("node-a", 5.0).unwrap();
        let second = registry.try_reserve("node-a", 5.0).unwrap();
        drop(first);
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 5.0);
        drop(second);
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 0.0);
    }

    #[test]
    fn test_candidates_ordered_by_utilization_then_id() {
        let registry = registry();
        registry
            .update_status("node-a", 0.0, 0.7, NodeStatus::Available)
            .unwrap();
        registry
            .update_status("node-b", 0.0, 0.2, NodeStatus::Available)
            .unwrap();

        let ids: Vec<String> = registry
            .candidates("reasoner", 1.0)
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["node-b", "node-a"]);

        registry
            .update_status("node-b", 0.0, 0.7, NodeStatus::Available)
            .unwrap();
        let ids: Vec<String> = registry
            .candidates("reasoner", 1.0)
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["node-a", "node-b"]);
    }

    #[test]
    fn test_candidates_filter_capacity_status_and_model() {
        let registry = registry();
        assert!(registry.reserve("node-a", 8.0));
        registry
            .update_status("node-b", 0.0, 0.0, NodeStatus::Offline)
            .unwrap();

        assert!(registry.candidates("reasoner", 4.0).is_empty());
        assert_eq!(registry.candidates("reasoner", 2.0).len(), 1);
        assert!(registry.candidates("unknown", 0.0).is_empty());
    }

    #[test]
    fn test_update_status_clamps_and_reports_missing() {
        let registry = registry();
        let node = registry
            .update_status("node-c", 99.0, 1.5, NodeStatus::Available)
            .unwrap();
        assert_eq!(node.used_capacity, 4.0);
        assert_eq!(node.compute_utilization, 1.0);

        assert!(matches!(
            registry.update_status("ghost", 0.0, 0.0, NodeStatus::Offline),
            Err(RegistryError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_could_host_ignores_status_and_usage() {
        let registry = registry();
        registry
            .update_status("node-c", 4.0, 1.0, NodeStatus::Offline)
            .unwrap();
        assert!(registry.could_host("polyglot", 4.0));
        assert!(!registry.could_host("polyglot", 5.0));
        assert!(!registry.could_host("missing", 0.0));
    }

    #[test]
    fn test_count_hosts_counts_each_node_once() {
        let registry = registry();
        let demand = |model: &str, amount: f64| (model.to_string(), amount);

        assert_eq!(registry.count_hosts(&[demand("reasoner", 1.0)]), 2);
        assert_eq!(
            registry.count_hosts(&[demand("reasoner", 1.0), demand("parser", 1.0)]),
            2
        );
        assert_eq!(
            registry.count_hosts(&[demand("parser", 1.0), demand("polyglot", 4.0)]),
            2
        );
        assert_eq!(registry.count_hosts(&[demand("polyglot", 5.0)]), 0);
        assert_eq!(registry.count_hosts(&[]), 0);
    }

    #[tokio::test]
    async fn test_release_notifies_watchers() {
        let registry = registry();
        let mut events = registry.capacity_events();
        let guard = registry.try_reserve("node-a", 1.0).unwrap();
        drop(guard);
        assert!(events.has_changed().unwrap());
        let _ = events.borrow_and_update();

        let tentative = registry.try_reserve("node-a", 1.0).unwrap();
        tentative.rollback();
        assert!(!events.has_changed().unwrap());
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_exceed_capacity() {
        let registry = Arc::new(NodeRegistry::new(vec![spec("node-a", 10.0, &["m"])]));
        let mut handles = Vec::new();

        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let mut granted = 0;
                for _ in 0..50 {
                    if let Some(guard) = registry.try_reserve("node-a", 3.0) {
                        let node = registry.get("node-a").unwrap();
                        assert!(node.used_capacity <= node.total_capacity);
                        granted += 1;
                        tokio::task::yield_now().await;
                        drop(guard);
                    }
                    tokio::task::yield_now().await;
                }
                granted
            }));
        }

        let mut total_granted = 0;
        for handle in handles {
            total_granted += handle.await.unwrap();
        }
        assert!(total_granted > 0);
        assert_eq!(registry.get("node-a").unwrap().used_capacity, 0.0);
    }
}
