//! Run state and reconstruction from events.
//!
//! A Run is one execution of a task graph, rebuilt from its event log so
//! `marginflow status` works for finished and crashed runs alike.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, NodeStatus};
use super::node::NodeId;
use super::report::ErrorKind;

/// Last known state of a node in a replayed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub status: NodeStatus,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// A task-graph execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Per-node status, keyed by node id
    pub nodes: BTreeMap<NodeId, NodeSummary>,
}

impl Run {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            nodes: BTreeMap::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self {
            started_at: first_event.timestamp,
            ..Self::new(first_event.run_id)
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::NodeStarted
            | EventType::NodeCompleted
            | EventType::NodeFailed
            | EventType::NodeCancelled => {
                let Some(node_id) = event.node_id else {
                    return;
                };
                let summary = self.nodes.entry(node_id).or_insert_with(|| NodeSummary {
                    name: event.node_name.clone().unwrap_or_default(),
                    status: NodeStatus::Pending,
                    duration_ms: None,
                    error: None,
                    error_kind: None,
                });
                summary.status = event.status;
                if event.duration_ms.is_some() {
                    summary.duration_ms = event.duration_ms;
                }
                if event.error.is_some() {
                    summary.error = event.error.clone();
                    summary.error_kind = event.error_kind;
                }
            }
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Nodes that ended in failure
    pub fn failed_nodes(&self) -> impl Iterator<Item = (&NodeId, &NodeSummary)> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Failed)
    }
}

/// State of a run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing (or crashed before finishing)
    #[default]
    Running,

    /// Every node completed, or was cancelled by the pipeline itself
    Completed,

    /// At least one node failed
    Failed { error: String },

    /// Stopped before every node had run
    Cancelled,
}
