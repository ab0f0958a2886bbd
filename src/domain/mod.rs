//! Domain types for the marginflow orchestrator.
//!
//! This module contains the core data structures:
//! - Artifact: Immutable file content and where it lives
//! - Node: Graph placement and resource hints
//! - Events: Immutable records of node transitions
//! - Report: Outcome of a finished run
//! - Run: Run state replayed from events

pub mod artifact;
pub mod events;
pub mod node;
pub mod report;
pub mod run;

// Re-export commonly used types
pub use artifact::{
    ArtifactFamily, ArtifactId, ArtifactRecord, FamilyError, IndexSuffix, Location, LocationError,
};
pub use events::{Event, EventType, NodeStatus};
pub use node::{Edge, NodeId, ResourceHint};
pub use report::{ErrorKind, NodeFailure, NodeReport, RunReport};
pub use run::{NodeSummary, Run, RunState};
