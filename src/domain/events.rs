//! Event types for the run log.
//!
//! Every node transition is recorded as an immutable event in an append-only
//! log, so the status of a finished (or crashed) run can be rebuilt later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeId;
use super::report::ErrorKind;

/// A single event in the append-only run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Node the event is about (None for run-level events)
    pub node_id: Option<NodeId>,

    /// Node name, repeated so the log reads on its own
    pub node_name: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub summary: String,

    /// Status after this event
    pub status: NodeStatus,

    /// Time taken in milliseconds (for finished nodes)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Error classification if failed
    pub error_kind: Option<ErrorKind>,
}

impl Event {
    /// Create a run-level event
    pub fn run(run_id: Uuid, event_type: EventType, summary: String, status: NodeStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            node_id: None,
            node_name: None,
            event_type,
            summary,
            status,
            duration_ms: None,
            error: None,
            error_kind: None,
        }
    }

    /// Create a node-level event
    pub fn node(
        run_id: Uuid,
        node_id: NodeId,
        node_name: &str,
        event_type: EventType,
        summary: String,
        status: NodeStatus,
    ) -> Self {
        Self {
            node_id: Some(node_id),
            node_name: Some(node_name.to_string()),
            ..Self::run(run_id, event_type, summary, status)
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, error: String) -> Self {
        self.error_kind = Some(kind);
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeCancelled,
}

/// Coarse node status as seen in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}
