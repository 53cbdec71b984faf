//! # Stage: Cluster Membership
//!
//! ## Responsibility
//! Expose a point-in-time view of known worker nodes and their load, plus
//! the local node's own in-flight count, and provide the load-greedy
//! candidate scan the distributor selects destinations with.
//!
//! ## Guarantees
//! - Injected: membership is an explicit dependency of the distributor,
//!   never a process-wide singleton, so tests can substitute a
//!   deterministic implementation
//! - Fresh: the distributor queries a new snapshot per selection event and
//!   never caches descriptors
//! - Best-effort: snapshots are eventually consistent, may be empty, and
//!   carry no ordering guarantee across calls
//!
//! ## NOT Responsible For
//! - Membership transport (gossip, heartbeats over the network)
//! - Connection management (see: `connection`)

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Point-in-time description of one worker node.
///
/// Descriptors are ephemeral: produced fresh per query, consumed by one
/// selection decision, never retained.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Network address of the node.
    pub address: String,
    /// Listening port; `0` denotes the local node in a selection scan.
    pub port: u16,
    /// Units of work the node currently has in flight.
    pub active_jobs: usize,
}

impl NodeDescriptor {
    /// Descriptor standing in for the local node with the given load.
    pub fn local(active_jobs: usize) -> Self {
        Self {
            address: String::new(),
            port: 0,
            active_jobs,
        }
    }

    /// Whether this descriptor denotes the local node.
    pub fn is_local(&self) -> bool {
        self.port == 0
    }

    /// `address:port` form used as a peer identifier.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Pull-based cluster membership query interface.
///
/// Implementations must be `Send + Sync`; both methods are synchronous
/// because a snapshot read must not block the caller on network traffic.
pub trait ClusterMembership: Send + Sync {
    /// Best-effort snapshot of known worker nodes. May be empty.
    fn node_info(&self) -> Vec<NodeDescriptor>;

    /// Units of work currently in flight on the local node.
    fn local_load(&self) -> usize;
}

/// Scan a fresh membership snapshot for a destination candidate.
///
/// The scan starts from "self" (local node at its current load) and
/// replaces the best candidate whenever a node with strictly lower load is
/// found, stopping early the first time the best candidate reaches zero
/// load. This is a greedy short-circuit, not a global minimum: with a
/// snapshot `[{A,5},{B,0},{C,0}]` the scan returns `B` and never inspects
/// `C`, and with a zero local load it returns "self" without looking past
/// the first entry.
///
/// # Panics
///
/// This function never panics.
pub fn select_candidate(membership: &dyn ClusterMembership) -> NodeDescriptor {
    let mut best = NodeDescriptor::local(membership.local_load());
    for node in membership.node_info() {
        if node.active_jobs < best.active_jobs {
            best = node;
        }
        if best.active_jobs == 0 {
            break;
        }
    }
    best
}

/// In-process membership registry.
///
/// Tracks remote nodes keyed by endpoint and the local in-flight counter.
/// Suitable both as the deterministic test double and as the adapter a
/// hosting process feeds from whatever discovery mechanism it runs.
///
/// # Panics
///
/// This type never panics; lock poisoning is absorbed by treating the
/// poisoned guard's data as authoritative.
///
/// # Example
///
/// ```rust
/// use tokio_pipeline_router::{ClusterMembership, SharedMembership};
///
/// let membership = SharedMembership::new();
/// membership.register("10.0.0.5", 9002, 3);
/// membership.job_started();
/// assert_eq!(membership.local_load(), 1);
/// assert_eq!(membership.node_info().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SharedMembership {
    nodes: RwLock<HashMap<String, NodeDescriptor>>,
    local_jobs: AtomicUsize,
}

impl SharedMembership {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a remote node, replacing any previous entry for the same
    /// endpoint.
    pub fn register(&self, address: &str, port: u16, active_jobs: usize) {
        let descriptor = NodeDescriptor {
            address: address.to_string(),
            port,
            active_jobs,
        };
        let endpoint = descriptor.endpoint();
        match self.nodes.write() {
            Ok(mut nodes) => {
                nodes.insert(endpoint.clone(), descriptor);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(endpoint.clone(), descriptor);
            }
        }
        debug!(endpoint = %endpoint, load = active_jobs, "node registered");
    }

    /// Update the load of a registered node.
    ///
    /// Returns `false` if the endpoint is unknown.
    pub fn update_load(&self, address: &str, port: u16, active_jobs: usize) -> bool {
        let endpoint = format!("{address}:{port}");
        let mut nodes = match self.nodes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match nodes.get_mut(&endpoint) {
            Some(node) => {
                node.active_jobs = active_jobs;
                true
            }
            None => false,
        }
    }

    /// Remove a node from the registry.
    ///
    /// Returns the removed descriptor, if any.
    pub fn deregister(&self, address: &str, port: u16) -> Option<NodeDescriptor> {
        let endpoint = format!("{address}:{port}");
        let mut nodes = match self.nodes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        nodes.remove(&endpoint)
    }

    /// Number of registered remote nodes.
    pub fn node_count(&self) -> usize {
        match self.nodes.read() {
            Ok(nodes) => nodes.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Record a unit of work entering local processing.
    pub fn job_started(&self) {
        self.local_jobs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a unit of work leaving local processing.
    pub fn job_finished(&self) {
        let _ = self
            .local_jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl ClusterMembership for SharedMembership {
    fn node_info(&self) -> Vec<NodeDescriptor> {
        match self.nodes.read() {
            Ok(nodes) => nodes.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    fn local_load(&self) -> usize {
        self.local_jobs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Membership double that returns a fixed snapshot in a fixed order.
    pub(crate) struct ScriptedMembership {
        pub nodes: Vec<NodeDescriptor>,
        pub local: usize,
    }

    impl ClusterMembership for ScriptedMembership {
        fn node_info(&self) -> Vec<NodeDescriptor> {
            self.nodes.clone()
        }

        fn local_load(&self) -> usize {
            self.local
        }
    }

    fn node(address: &str, load: usize) -> NodeDescriptor {
        NodeDescriptor {
            address: address.to_string(),
            port: 9002,
            active_jobs: load,
        }
    }

    #[test]
    fn test_select_first_zero_load_short_circuits() {
        // self load = 2, nodes in order [{A,5},{B,0},{C,1}] → B wins.
        let membership = ScriptedMembership {
            nodes: vec![node("A", 5), node("B", 0), node("C", 1)],
            local: 2,
        };
        let picked = select_candidate(&membership);
        assert_eq!(picked.address, "B");
    }

    #[test]
    fn test_select_stops_at_first_zero_not_global_minimum() {
        // A later zero-load node never replaces the first one found.
        let membership = ScriptedMembership {
            nodes: vec![node("A", 5), node("B", 0), node("C", 0)],
            local: 2,
        };
        let picked = select_candidate(&membership);
        assert_eq!(picked.address, "B");
    }

    #[test]
    fn test_select_empty_snapshot_returns_self() {
        let membership = ScriptedMembership {
            nodes: vec![],
            local: 3,
        };
        let picked = select_candidate(&membership);
        assert!(picked.is_local());
        assert_eq!(picked.active_jobs, 3);
    }

    #[test]
    fn test_select_idle_local_node_wins_immediately() {
        // Local load 0 short-circuits on the first iteration.
        let membership = ScriptedMembership {
            nodes: vec![node("A", 0), node("B", 0)],
            local: 0,
        };
        let picked = select_candidate(&membership);
        assert!(picked.is_local());
    }

    #[test]
    fn test_select_strictly_lower_load_required() {
        // Equal load does not displace self.
        let membership = ScriptedMembership {
            nodes: vec![node("A", 2)],
            local: 2,
        };
        let picked = select_candidate(&membership);
        assert!(picked.is_local());
    }

    #[test]
    fn test_select_picks_running_minimum_without_zero() {
        let membership = ScriptedMembership {
            nodes: vec![node("A", 4), node("B", 3), node("C", 5)],
            local: 6,
        };
        let picked = select_candidate(&membership);
        assert_eq!(picked.address, "B");
    }

    #[test]
    fn test_register_and_snapshot() {
        let membership = SharedMembership::new();
        membership.register("host1", 9002, 1);
        membership.register("host2", 9002, 4);
        assert_eq!(membership.node_count(), 2);
        assert_eq!(membership.node_info().len(), 2);
    }

    #[test]
    fn test_register_replaces_same_endpoint() {
        let membership = SharedMembership::new();
        membership.register("host1", 9002, 1);
        membership.register("host1", 9002, 7);
        assert_eq!(membership.node_count(), 1);
        assert_eq!(membership.node_info()[0].active_jobs, 7);
    }

    #[test]
    fn test_update_load_known_and_unknown() {
        let membership = SharedMembership::new();
        membership.register("host1", 9002, 1);
        assert!(membership.update_load("host1", 9002, 9));
        assert!(!membership.update_load("ghost", 9002, 9));
        assert_eq!(membership.node_info()[0].active_jobs, 9);
    }

    #[test]
    fn test_deregister_removes_node() {
        let membership = SharedMembership::new();
        membership.register("host1", 9002, 1);
        assert!(membership.deregister("host1", 9002).is_some());
        assert!(membership.deregister("host1", 9002).is_none());
        assert_eq!(membership.node_count(), 0);
    }

    #[test]
    fn test_local_job_counter() {
        let membership = SharedMembership::new();
        assert_eq!(membership.local_load(), 0);
        membership.job_started();
        membership.job_started();
        assert_eq!(membership.local_load(), 2);
        membership.job_finished();
        assert_eq!(membership.local_load(), 1);
    }

    #[test]
    fn test_local_job_counter_never_underflows() {
        let membership = SharedMembership::new();
        membership.job_finished();
        assert_eq!(membership.local_load(), 0);
    }

    #[test]
    fn test_descriptor_local_and_endpoint() {
        let local = NodeDescriptor::local(2);
        assert!(local.is_local());
        assert_eq!(local.active_jobs, 2);

        let remote = node("host1", 0);
        assert!(!remote.is_local());
        assert_eq!(remote.endpoint(), "host1:9002");
    }

    #[test]
    fn test_descriptor_serde_round_trip() {
        let descriptor = node("host1", 3);
        let json = serde_json::to_string(&descriptor).expect("serialize");
        let parsed: NodeDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, descriptor);
    }
}
