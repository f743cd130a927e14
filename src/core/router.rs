//! Deterministic partition routing.
//!
//! A task's partition is a pure function of its category and worker type,
//! so every process in a deployment routes the same pair to the same queue.
//! Partitions map onto store nodes with a plain modulo.

use crate::task::{PartitionId, WorkerType};
use crate::utils::fnv1a;

/// Maps `(category, worker type)` pairs to partitions.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRouter {
    partition_count: u32,
}

impl PartitionRouter {
    /// A router over `partition_count` partitions (at least one).
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Partition for a category and worker type.
    pub fn route(&self, category: &str, worker_type: WorkerType) -> PartitionId {
        let key = format!("{}|{}", category, worker_type.as_str());
        (fnv1a(key.as_bytes()) % u64::from(self.partition_count)) as PartitionId
    }

    /// Every partition id, in order.
    pub fn all_partitions(&self) -> Vec<PartitionId> {
        (0..self.partition_count).collect()
    }
}

/// Store node owning a partition.
pub fn node_for_partition(partition: PartitionId, node_count: usize) -> usize {
    partition as usize % node_count.max(1)
}

/// Store node owning a named key such as a lock.
pub fn node_for_key(key: &str, node_count: usize) -> usize {
    (fnv1a(key.as_bytes()) % node_count.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_deterministic() {
        let a = PartitionRouter::new(16);
        let b = PartitionRouter::new(16);
        for category in ["billing", "reports", "email", ""] {
            for worker_type in WorkerType::ALL {
                assert_eq!(a.route(category, worker_type), b.route(category, worker_type));
                assert!(a.route(category, worker_type) < 16);
            }
        }
    }

    #[test]
    fn test_route_depends_on_worker_type() {
        let router = PartitionRouter::new(1024);
        let partitions: std::collections::HashSet<_> = WorkerType::ALL
            .into_iter()
            .map(|wt| router.route("billing", wt))
            .collect();
        assert!(partitions.len() > 1);
    }

    #[test]
    fn test_known_route() {
        let router = PartitionRouter::new(16);
        let expected = (fnv1a(b"billing|CPU_INTENSIVE") % 16) as PartitionId;
        assert_eq!(router.route("billing", WorkerType::CpuIntensive), expected);
    }

    #[test]
    fn test_single_partition_and_nodes() {
        let router = PartitionRouter::new(0);
        assert_eq!(router.partition_count(), 1);
        assert_eq!(router.route("anything", WorkerType::IoIntensive), 0);

        assert_eq!(node_for_partition(5, 3), 2);
        assert_eq!(node_for_partition(5, 0), 0);
        assert!(node_for_key("lock-a", 4) < 4);
        assert_eq!(node_for_key("lock-a", 4), node_for_key("lock-a", 4));
    }
}
