//! Node-selection policies.
//!
//! A [`Balancer`] decides which back-end node a newly accepted peer is
//! bound to. The set of algorithms is closed: dispatch is an enum, not a
//! trait object, so the service's hot path stays monomorphic.

mod connection_count;
mod round_robin;

pub use connection_count::ConnectionCount;
pub use round_robin::RoundRobin;

use crate::node::NodeId;

/// Balancing algorithm selector, as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Algorithm {
    #[default]
    RoundRobin,
    ConnectionCount,
}

/// A node-selection policy with hot membership changes.
///
/// All operations are internally synchronized; concurrent `associate` and
/// `select` calls are legal.
pub enum Balancer {
    RoundRobin(RoundRobin),
    ConnectionCount(ConnectionCount),
}

impl Balancer {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::RoundRobin => Balancer::RoundRobin(RoundRobin::new()),
            Algorithm::ConnectionCount => Balancer::ConnectionCount(ConnectionCount::new()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Balancer::RoundRobin(_) => Algorithm::RoundRobin,
            Balancer::ConnectionCount(_) => Algorithm::ConnectionCount,
        }
    }

    /// Pick the node for a new connection, committing any per-connection
    /// accounting. Returns `None` when the membership is empty.
    pub fn select(&self) -> Option<NodeId> {
        match self {
            Balancer::RoundRobin(b) => b.select(),
            Balancer::ConnectionCount(b) => b.select(),
        }
    }

    /// Report which node `select` would currently pick, without mutation.
    pub fn peek(&self) -> Option<NodeId> {
        match self {
            Balancer::RoundRobin(b) => b.peek(),
            Balancer::ConnectionCount(b) => b.peek(),
        }
    }

    /// Commit a connection to a specific node (session affinity). Returns
    /// false when the node is not a member, in which case the caller falls
    /// back to `select`.
    pub fn pin(&self, node: NodeId) -> bool {
        match self {
            Balancer::RoundRobin(b) => b.pin(node),
            Balancer::ConnectionCount(b) => b.pin(node),
        }
    }

    /// Give back the connection credit taken by `select` or `pin` when the
    /// peer is destroyed.
    pub fn release(&self, node: NodeId) {
        match self {
            Balancer::RoundRobin(_) => {}
            Balancer::ConnectionCount(b) => b.release(node),
        }
    }

    /// Add a node to the membership. Duplicates are ignored.
    pub fn associate(&self, node: NodeId) {
        match self {
            Balancer::RoundRobin(b) => b.associate(node),
            Balancer::ConnectionCount(b) => b.associate(node),
        }
    }

    /// Remove a node from the membership. Absent nodes are ignored.
    pub fn detach(&self, node: NodeId) {
        match self {
            Balancer::RoundRobin(b) => b.detach(node),
            Balancer::ConnectionCount(b) => b.detach(node),
        }
    }

    pub fn detach_all(&self) {
        match self {
            Balancer::RoundRobin(b) => b.detach_all(),
            Balancer::ConnectionCount(b) => b.detach_all(),
        }
    }

    /// Current membership, in no particular order.
    pub fn members(&self) -> Vec<NodeId> {
        match self {
            Balancer::RoundRobin(b) => b.members(),
            Balancer::ConnectionCount(b) => b.members(),
        }
    }

    /// Re-associate every current member into `other`, replacing its
    /// membership. Returns the number of nodes copied.
    pub fn copy_to(&self, other: &Balancer) -> usize {
        let members = self.members();
        other.detach_all();
        for &node in &members {
            other.associate(node);
        }
        members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: u32) -> Vec<NodeId> {
        (0..n).map(NodeId).collect()
    }

    #[test]
    fn test_empty_balancer_selects_nothing() {
        for algorithm in [Algorithm::RoundRobin, Algorithm::ConnectionCount] {
            let balancer = Balancer::new(algorithm);
            assert!(balancer.select().is_none());
            assert!(balancer.peek().is_none());
        }
    }

    #[test]
    fn test_associate_detach_round_trip() {
        for algorithm in [Algorithm::RoundRobin, Algorithm::ConnectionCount] {
            let balancer = Balancer::new(algorithm);
            let [a, b] = [NodeId(1), NodeId(2)];
            balancer.associate(a);

            let before = {
                let mut m = balancer.members();
                m.sort();
                m
            };
            balancer.associate(b);
            balancer.detach(b);
            let mut after = balancer.members();
            after.sort();
            assert_eq!(before, after);

            // Duplicate associate and absent detach are no-ops.
            balancer.associate(a);
            balancer.detach(NodeId(99));
            let mut again = balancer.members();
            again.sort();
            assert_eq!(before, again);
        }
    }

    #[test]
    fn test_copy_to_replaces_target_membership() {
        let source = Balancer::new(Algorithm::RoundRobin);
        for node in nodes(3) {
            source.associate(node);
        }
        let target = Balancer::new(Algorithm::ConnectionCount);
        target.associate(NodeId(42));

        assert_eq!(source.copy_to(&target), 3);
        let mut members = target.members();
        members.sort();
        assert_eq!(members, nodes(3));
    }

    #[test]
    fn test_detach_all() {
        let balancer = Balancer::new(Algorithm::ConnectionCount);
        for node in nodes(4) {
            balancer.associate(node);
        }
        balancer.detach_all();
        assert!(balancer.members().is_empty());
        assert!(balancer.select().is_none());
    }
}
