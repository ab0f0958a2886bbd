//! The task graph: node table, ordering rules and failure propagation.
//!
//! Nodes form a tree. Each node hangs off its parent by a child edge or by
//! the k-th follow-on edge:
//! - a child may start once its parent's body has completed;
//! - follow-on k may start once its parent has completed, every child
//!   subtree of the parent has settled, and follow-ons `0..k` have settled.
//!
//! A subtree is settled when each node in it has completed or was
//! cancelled. A failed node is never settled, so it blocks whatever waits on
//! it; [`TaskGraph::propagate`] turns those blocked nodes into failures.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Edge, ErrorKind, NodeId, NodeReport, NodeStatus, ResourceHint};

use super::job::{ErasedBody, ErasedJob};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node '{consumer}' consumes the output of {producer}, which is not guaranteed to finish before it starts")]
    PromiseOutOfScope { producer: NodeId, consumer: String },

    #[error("Promise from {0} read before its producer completed")]
    PromiseUnresolved(NodeId),

    #[error("Cannot add nodes under {target} from {caller}: target must be the caller or one of its pending descendants")]
    InvalidTarget { caller: NodeId, target: NodeId },

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
}

/// Why a node failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The node's own body failed
    Error { kind: ErrorKind, message: String },

    /// The node never ran because this failed node blocks it
    Upstream(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Runnable,
    Running,
    Completed,
    Failed(Failure),
    Cancelled,
}

impl NodeState {
    pub fn status(&self) -> NodeStatus {
        match self {
            NodeState::Pending | NodeState::Runnable => NodeStatus::Pending,
            NodeState::Running => NodeStatus::Running,
            NodeState::Completed => NodeStatus::Completed,
            NodeState::Failed(_) => NodeStatus::Failed,
            NodeState::Cancelled => NodeStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed(_) | NodeState::Cancelled
        )
    }

    fn is_waiting(&self) -> bool {
        matches!(self, NodeState::Pending | NodeState::Runnable)
    }
}

pub(crate) struct Node {
    pub name: String,
    pub parent: Option<(NodeId, Edge)>,
    pub children: Vec<NodeId>,
    pub follow_ons: Vec<NodeId>,
    pub producers: Vec<NodeId>,
    pub state: NodeState,
    pub resources: ResourceHint,
    pub deadline: Option<Duration>,
    pub body: Option<ErasedBody>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Cancel requested while running; applied when the body returns
    pub cancel_requested: bool,
}

/// Which kind of edge to add a node with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    Child,
    FollowOn,
}

/// All nodes of one run
#[derive(Default)]
pub(crate) struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id.index()).ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.index())
            .ok_or(GraphError::UnknownNode(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId::from_index)
    }

    fn state(&self, id: NodeId) -> &NodeState {
        &self.nodes[id.index()].state
    }

    fn push(&mut self, job: ErasedJob, parent: Option<(NodeId, Edge)>) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node {
            name: job.name,
            parent,
            children: Vec::new(),
            follow_ons: Vec::new(),
            producers: job.producers,
            state: NodeState::Pending,
            resources: job.resources,
            deadline: job.deadline,
            body: Some(job.body),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
        });
        id
    }

    /// Place the root node; it may not consume promises
    pub fn insert_root(&mut self, job: ErasedJob) -> Result<NodeId, GraphError> {
        if let Some(&producer) = job.producers.first() {
            return Err(GraphError::PromiseOutOfScope {
                producer,
                consumer: job.name,
            });
        }
        Ok(self.push(job, None))
    }

    /// Place `job` under `parent`, checking that every promise it consumes
    /// will have been produced before it can start
    pub fn insert(
        &mut self,
        parent: NodeId,
        attach: Attach,
        job: ErasedJob,
    ) -> Result<NodeId, GraphError> {
        let parent_node = self.node(parent)?;
        let edge = match attach {
            Attach::Child => Edge::Child,
            Attach::FollowOn => Edge::FollowOn(parent_node.follow_ons.len()),
        };

        for &producer in &job.producers {
            self.node(producer)?;
            if !self.precedes(producer, parent, edge) {
                return Err(GraphError::PromiseOutOfScope {
                    producer,
                    consumer: job.name,
                });
            }
        }

        let id = self.push(job, Some((parent, edge)));
        let parent_node = &mut self.nodes[parent.index()];
        match edge {
            Edge::Child => parent_node.children.push(id),
            Edge::FollowOn(_) => parent_node.follow_ons.push(id),
        }
        Ok(id)
    }

    /// Whether `caller` may attach nodes under `target`
    pub fn check_target(&self, caller: NodeId, target: NodeId) -> Result<(), GraphError> {
        let invalid = GraphError::InvalidTarget { caller, target };
        self.node(target)?;
        if target == caller {
            return Ok(());
        }
        if !self.state(target).is_waiting() || !self.is_ancestor(caller, target) {
            return Err(invalid);
        }
        Ok(())
    }

    /// True if `ancestor` is a strict structural ancestor of `node`
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes[node.index()].parent;
        while let Some((parent, _)) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes[parent.index()].parent;
        }
        false
    }

    fn in_subtree(&self, root: NodeId, node: NodeId) -> bool {
        root == node || self.is_ancestor(root, node)
    }

    /// Would a node placed under `parent` by `edge` only ever start after
    /// `producer` has completed?
    ///
    /// Walks up from the new position. At each step the node is ordered
    /// after its parent, and a follow-on is also ordered after the parent's
    /// children and earlier follow-ons, including their subtrees.
    pub fn precedes(&self, producer: NodeId, parent: NodeId, edge: Edge) -> bool {
        let mut parent = parent;
        let mut edge = edge;

        loop {
            if producer == parent {
                return true;
            }

            if let Edge::FollowOn(k) = edge {
                let node = &self.nodes[parent.index()];
                let earlier = node
                    .children
                    .iter()
                    .chain(node.follow_ons.iter().take(k));
                for &sibling in earlier {
                    if self.in_subtree(sibling, producer) {
                        return true;
                    }
                }
            }

            match self.nodes[parent.index()].parent {
                Some((grandparent, parent_edge)) => {
                    parent = grandparent;
                    edge = parent_edge;
                }
                None => return false,
            }
        }
    }

    /// Every node has completed or been cancelled, down the whole subtree
    fn settled(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.index()];
        matches!(node.state, NodeState::Completed | NodeState::Cancelled)
            && node
                .children
                .iter()
                .chain(node.follow_ons.iter())
                .all(|&n| self.settled(n))
    }

    /// First failed node in the subtree, if any
    fn poisoned(&self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id.index()];
        if matches!(node.state, NodeState::Failed(_)) {
            return Some(id);
        }
        node.children
            .iter()
            .chain(node.follow_ons.iter())
            .find_map(|&n| self.poisoned(n))
    }

    /// Whether a waiting node may start now
    pub fn is_ready(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.index()];
        if !node.state.is_waiting() {
            return false;
        }

        if !node
            .producers
            .iter()
            .all(|&p| *self.state(p) == NodeState::Completed)
        {
            return false;
        }

        match node.parent {
            None => true,
            Some((parent, Edge::Child)) => *self.state(parent) == NodeState::Completed,
            Some((parent, Edge::FollowOn(k))) => {
                let p = &self.nodes[parent.index()];
                p.state == NodeState::Completed
                    && p.children.iter().all(|&c| self.settled(c))
                    && p.follow_ons.iter().take(k).all(|&f| self.settled(f))
            }
        }
    }

    /// What, if anything, prevents a waiting node from ever running
    fn blocker(&self, id: NodeId) -> Option<NodeState> {
        let node = &self.nodes[id.index()];

        if let Some((parent, edge)) = node.parent {
            match self.state(parent) {
                NodeState::Failed(_) => return Some(NodeState::Failed(Failure::Upstream(parent))),
                NodeState::Cancelled => return Some(NodeState::Cancelled),
                _ => {}
            }

            if let Edge::FollowOn(k) = edge {
                let p = &self.nodes[parent.index()];
                let earlier = p.children.iter().chain(p.follow_ons.iter().take(k));
                for &sibling in earlier {
                    if let Some(failed) = self.poisoned(sibling) {
                        return Some(NodeState::Failed(Failure::Upstream(failed)));
                    }
                }
            }
        }

        for &producer in &node.producers {
            match self.state(producer) {
                NodeState::Failed(_) => {
                    return Some(NodeState::Failed(Failure::Upstream(producer)))
                }
                NodeState::Cancelled => return Some(NodeState::Cancelled),
                _ => {}
            }
        }

        None
    }

    /// Fail or cancel every waiting node that can no longer run, until
    /// nothing changes. Returns the nodes changed, in the order changed.
    pub fn propagate(&mut self) -> Vec<NodeId> {
        let mut changed = Vec::new();
        loop {
            let mut progressed = false;
            for index in 0..self.nodes.len() {
                let id = NodeId::from_index(index);
                if !self.nodes[index].state.is_waiting() {
                    continue;
                }
                if let Some(state) = self.blocker(id) {
                    let node = &mut self.nodes[index];
                    node.state = state;
                    node.body = None;
                    node.finished_at = Some(Utc::now());
                    changed.push(id);
                    progressed = true;
                }
            }
            if !progressed {
                return changed;
            }
        }
    }

    /// Waiting nodes that may start, in declaration order
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.ids()
            .filter(|&id| *self.state(id) == NodeState::Pending && self.is_ready(id))
            .collect()
    }

    /// Cancel `id` and everything under it that has not started.
    ///
    /// Running nodes are left to finish and are marked cancelled when they
    /// return. Returns the nodes cancelled right away.
    pub fn cancel(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut cancelled = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &mut self.nodes[current.index()];
            match node.state {
                NodeState::Pending | NodeState::Runnable => {
                    node.state = NodeState::Cancelled;
                    node.body = None;
                    node.finished_at = Some(Utc::now());
                    cancelled.push(current);
                }
                NodeState::Running => node.cancel_requested = true,
                _ => {}
            }
            stack.extend(node.children.iter().chain(node.follow_ons.iter()).copied());
        }
        cancelled
    }

    /// Nodes not yet in a terminal state
    pub fn unfinished(&self) -> Vec<NodeId> {
        self.ids()
            .filter(|&id| !self.state(id).is_terminal())
            .collect()
    }

    /// Snapshot of every node for the run report
    pub fn report_nodes(&self) -> Vec<NodeReport> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeReport {
                id: NodeId::from_index(index),
                name: node.name.clone(),
                parent: node.parent.map(|(p, _)| p),
                edge: node.parent.map(|(_, e)| e),
                status: node.state.status(),
                resources: node.resources,
                started_at: node.started_at,
                finished_at: node.finished_at,
            })
            .collect()
    }
}
