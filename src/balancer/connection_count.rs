//! Least-connections node selection.

use crate::node::NodeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Picks the node with the fewest live connections; ties break by
/// insertion order.
///
/// The ordered set is keyed `(count, sequence)` where the sequence is
/// assigned afresh every time a node's entry is reinserted, so among equal
/// counts the longest-resident entry wins.
pub struct ConnectionCount {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    by_load: BTreeSet<(u32, u64, NodeId)>,
    members: HashMap<NodeId, (u32, u64)>,
    next_seq: u64,
}

impl State {
    fn reinsert(&mut self, node: NodeId, count: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_load.insert((count, seq, node));
        self.members.insert(node, (count, seq));
    }

    fn take(&mut self, node: NodeId) -> Option<u32> {
        let (count, seq) = self.members.remove(&node)?;
        self.by_load.remove(&(count, seq, node));
        Some(count)
    }
}

impl ConnectionCount {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    /// Pick the minimum-count node and charge one connection to it.
    pub fn select(&self) -> Option<NodeId> {
        let mut state = self.state.lock().unwrap();
        let &(count, _, node) = state.by_load.iter().next()?;
        state.take(node);
        state.reinsert(node, count + 1);
        Some(node)
    }

    /// The node `select` would pick, with no accounting.
    pub fn peek(&self) -> Option<NodeId> {
        let state = self.state.lock().unwrap();
        state.by_load.iter().next().map(|&(_, _, node)| node)
    }

    /// Charge one connection to a specific node. False if it is not a
    /// member.
    pub fn pin(&self, node: NodeId) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.take(node) {
            Some(count) => {
                state.reinsert(node, count + 1);
                true
            }
            None => false,
        }
    }

    /// Give back one connection credit. Absent nodes are ignored.
    pub fn release(&self, node: NodeId) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.take(node) {
            state.reinsert(node, count.saturating_sub(1));
        }
    }

    pub fn associate(&self, node: NodeId) {
        let mut state = self.state.lock().unwrap();
        if !state.members.contains_key(&node) {
            state.reinsert(node, 0);
        }
    }

    pub fn detach(&self, node: NodeId) {
        let mut state = self.state.lock().unwrap();
        state.take(node);
    }

    pub fn detach_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.by_load.clear();
        state.members.clear();
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.state.lock().unwrap().members.keys().copied().collect()
    }

    /// Live connection count of a node, for diagnostics.
    pub fn count_of(&self, node: NodeId) -> Option<u32> {
        self.state.lock().unwrap().members.get(&node).map(|&(count, _)| count)
    }
}

impl Default for ConnectionCount {
    fn default() -> Self {
        Self::new()
    }
}
