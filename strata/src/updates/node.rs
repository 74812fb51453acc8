//! Version nodes and the arena-backed chain that owns them

use crate::txn::{Timestamp, Txn, TxnId};
use crate::{Result, StrataError};

/// Stable index of a node inside its chain's arena
pub type NodeId = u32;

/// Lifecycle of a version node; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Active,
    Preparing,
    Committed,
    RolledBack,
}

/// One mutation made by one transaction against one chain
#[derive(Debug, Clone)]
pub struct VersionNode<P> {
    id: NodeId,
    txn_id: TxnId,
    start_ts: Timestamp,
    commit_ts: Option<Timestamp>,
    state: NodeState,
    pub(crate) payload: P,
}

impl<P> VersionNode<P> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        self.commit_ts
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn is_committed(&self) -> bool {
        self.state == NodeState::Committed
    }

    /// Active or Preparing
    pub fn is_pending(&self) -> bool {
        matches!(self.state, NodeState::Active | NodeState::Preparing)
    }

    /// Whether a reader at `read_ts` observes this node.
    ///
    /// Committed nodes are visible from their commit timestamp on. A pending
    /// node is visible only to its own transaction, whose read timestamp is
    /// its start timestamp.
    #[inline]
    pub fn visible_to(&self, read_ts: Timestamp) -> bool {
        match self.state {
            NodeState::Committed => self.commit_ts.map(|ts| ts <= read_ts).unwrap_or(false),
            NodeState::Active | NodeState::Preparing => self.start_ts == read_ts,
            NodeState::RolledBack => false,
        }
    }

    /// Committed with `start < commit_ts <= end`
    #[inline]
    pub fn committed_in(&self, start: Timestamp, end: Timestamp) -> bool {
        self.state == NodeState::Committed
            && self.commit_ts.map(|ts| ts > start && ts <= end).unwrap_or(false)
    }

    /// Fail unless the payload may still be written
    pub fn check_writable(&self) -> Result<()> {
        if self.state != NodeState::Active {
            return Err(StrataError::Invariant(format!(
                "write through node {} in state {:?}",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

/// Arena of version nodes in creation order
///
/// Node ids are arena indices and never reused, so rows and merge nodes can
/// refer to nodes by id.
#[derive(Debug, Clone)]
pub struct VersionChain<P> {
    nodes: Vec<VersionNode<P>>,
}

impl<P> Default for VersionChain<P> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<P> VersionChain<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an `Active` node owned by `txn`
    pub fn add_node(&mut self, txn: &Txn, payload: P) -> NodeId {
        self.push(txn.id(), txn.start_ts(), None, NodeState::Active, payload)
    }

    /// Append a node that is committed from birth (merge nodes)
    pub(crate) fn add_committed(&mut self, commit_ts: Timestamp, payload: P) -> NodeId {
        self.push(0, commit_ts, Some(commit_ts), NodeState::Committed, payload)
    }

    fn push(
        &mut self,
        txn_id: TxnId,
        start_ts: Timestamp,
        commit_ts: Option<Timestamp>,
        state: NodeState,
        payload: P,
    ) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(VersionNode { id, txn_id, start_ts, commit_ts, state, payload });
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&VersionNode<P>> {
        self.nodes
            .get(id as usize)
            .ok_or_else(|| StrataError::Invariant(format!("unknown version node {}", id)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut VersionNode<P>> {
        self.nodes
            .get_mut(id as usize)
            .ok_or_else(|| StrataError::Invariant(format!("unknown version node {}", id)))
    }

    /// Active → Preparing
    pub fn prepare(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        match node.state {
            NodeState::Active => {
                node.state = NodeState::Preparing;
                Ok(())
            }
            NodeState::Preparing => Ok(()),
            other => Err(StrataError::Invariant(format!(
                "prepare node {} in state {:?}",
                id, other
            ))),
        }
    }

    /// Active | Preparing → Committed at `commit_ts`
    pub fn commit(&mut self, id: NodeId, commit_ts: Timestamp) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_pending() {
            return Err(StrataError::Invariant(format!(
                "commit node {} in state {:?}",
                id, node.state
            )));
        }
        if commit_ts < node.start_ts {
            return Err(StrataError::Invariant(format!(
                "commit ts {} precedes start ts {} of node {}",
                commit_ts, node.start_ts, id
            )));
        }
        node.state = NodeState::Committed;
        node.commit_ts = Some(commit_ts);
        Ok(())
    }

    /// Active | Preparing → RolledBack
    pub fn rollback(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_pending() {
            return Err(StrataError::Invariant(format!(
                "rollback node {} in state {:?}",
                id, node.state
            )));
        }
        node.state = NodeState::RolledBack;
        Ok(())
    }

    /// Nodes from newest to oldest
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &VersionNode<P>> {
        self.nodes.iter().rev()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionNode<P>> {
        self.nodes.iter()
    }

    /// Number of nodes ever added, including rolled back ones
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that were not rolled back
    pub fn live_len(&self) -> usize {
        self.nodes.iter().filter(|n| n.state != NodeState::RolledBack).count()
    }

    pub fn has_pending(&self) -> bool {
        self.nodes.iter().any(|n| n.is_pending())
    }

    /// Newest commit timestamp in the chain
    pub fn max_commit_ts(&self) -> Option<Timestamp> {
        self.nodes.iter().filter_map(|n| n.commit_ts).max()
    }
}
