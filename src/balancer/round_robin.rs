//! Round-robin node selection.

use crate::node::NodeId;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Strict rotating assignment, independent of load.
///
/// Keeps the rotation order and a set view of the same membership; the two
/// always agree.
pub struct RoundRobin {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    order: VecDeque<NodeId>,
    members: HashSet<NodeId>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    /// Pop the head of the rotation and push it to the tail.
    pub fn select(&self) -> Option<NodeId> {
        let mut state = self.state.lock().unwrap();
        let node = state.order.pop_front()?;
        state.order.push_back(node);
        Some(node)
    }

    pub fn peek(&self) -> Option<NodeId> {
        self.state.lock().unwrap().order.front().copied()
    }

    pub fn pin(&self, node: NodeId) -> bool {
        self.state.lock().unwrap().members.contains(&node)
    }

    pub fn associate(&self, node: NodeId) {
        let mut state = self.state.lock().unwrap();
        if state.members.insert(node) {
            state.order.push_back(node);
        }
    }

    pub fn detach(&self, node: NodeId) {
        let mut state = self.state.lock().unwrap();
        if state.members.remove(&node) {
            state.order.retain(|&n| n != node);
        }
    }

    pub fn detach_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.order.clear();
        state.members.clear();
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.state.lock().unwrap().members.iter().copied().collect()
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_rotation_order() {
        let rr = RoundRobin::new();
        for id in 0..3 {
            rr.associate(NodeId(id));
        }

        let picks: Vec<_> = (0..7).map(|_| rr.select().unwrap()).collect();
        let expected: Vec<_> =
            [0, 1, 2, 0, 1, 2, 0].iter().map(|&id| NodeId(id)).collect();
        assert_eq!(picks, expected);
    }

    #[test]
    fn test_fair_distribution() {
        let rr = RoundRobin::new();
        let m = 3u32;
        for id in 0..m {
            rr.associate(NodeId(id));
        }

        let n = 100usize;
        let mut counts: HashMap<NodeId, usize> = HashMap::new();
        for _ in 0..n {
            *counts.entry(rr.select().unwrap()).or_default() += 1;
        }
        // Each member is returned floor(n/m) or ceil(n/m) times.
        for id in 0..m {
            let count = counts[&NodeId(id)];
            assert!(count == n / m as usize || count == n.div_ceil(m as usize));
        }
    }

    #[test]
    fn test_peek_does_not_rotate() {
        let rr = RoundRobin::new();
        rr.associate(NodeId(1));
        rr.associate(NodeId(2));

        assert_eq!(rr.peek(), Some(NodeId(1)));
        assert_eq!(rr.peek(), Some(NodeId(1)));
        assert_eq!(rr.select(), Some(NodeId(1)));
        assert_eq!(rr.peek(), Some(NodeId(2)));
    }

    #[test]
    fn test_detach_mid_rotation() {
        let rr = RoundRobin::new();
        for id in 0..3 {
            rr.associate(NodeId(id));
        }
        rr.select();
        rr.detach(NodeId(1));

        let picks: Vec<_> = (0..4).map(|_| rr.select().unwrap()).collect();
        assert_eq!(picks, vec![NodeId(2), NodeId(0), NodeId(2), NodeId(0)]);
    }
}
