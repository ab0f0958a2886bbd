//! What a finished run looks like from the outside.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactId;
use super::events::NodeStatus;
use super::node::{Edge, NodeId, ResourceHint};

/// Closed classification of node failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Import source does not exist
    NotFound,

    /// Unknown artifact id referenced
    MissingArtifact,

    /// Two staged files would share a name
    DuplicateName,

    /// Staging failed part way and was rolled back
    StageFailed,

    /// External tool exited non-zero or could not start
    ToolFailed,

    /// A promise was used outside its producer's descendants
    PromiseUnresolved,

    /// Node exceeded its deadline
    Timeout,

    /// Node body panicked
    Panicked,

    /// An upstream node failed so this one never ran
    Upstream,

    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::MissingArtifact => "missing_artifact",
            ErrorKind::DuplicateName => "duplicate_name",
            ErrorKind::StageFailed => "stage_failed",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::PromiseUnresolved => "promise_unresolved",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Panicked => "panicked",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Diagnosis for one failed node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: NodeId,
    pub name: String,
    pub kind: ErrorKind,
    pub message: String,

    /// Artifacts the node had staged when it failed
    pub inputs: Vec<ArtifactId>,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} '{}' failed ({}): {}", self.node, self.name, self.kind, self.message)?;
        if !self.inputs.is_empty() {
            let ids: Vec<String> = self.inputs.iter().map(|id| id.to_string()).collect();
            write!(f, " [inputs: {}]", ids.join(", "))?;
        }
        Ok(())
    }
}

/// Per-node summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
    pub edge: Option<Edge>,
    pub status: NodeStatus,
    pub resources: ResourceHint,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Summary of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Every node, in declaration order
    pub nodes: Vec<NodeReport>,

    pub failures: Vec<NodeFailure>,

    /// Node ids in the order their bodies started
    pub execution_order: Vec<NodeId>,

    /// The whole run was stopped before it finished
    #[serde(default)]
    pub cancelled: bool,
}

impl RunReport {
    /// True when no node failed and the run was not stopped early
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeReport> {
        self.nodes.get(id.index())
    }

    /// Names of nodes whose bodies ran, in start order
    pub fn executed(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .filter_map(|id| self.node(*id))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// First node with the given name
    pub fn find(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn count_with_status(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}
