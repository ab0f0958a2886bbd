//! Core orchestration logic.
//!
//! This module contains:
//! - Store: Content-addressed artifact store
//! - Workspace: Per-node staging directories
//! - Job / Graph: Typed jobs, promises and the task graph
//! - Scheduler: Dependency-driven execution engine
//! - Shard: Fan-out / fan-in helpers
//! - EventStore: Append-only run event log

pub mod event_store;
pub mod graph;
pub mod job;
pub mod scheduler;
pub mod shard;
pub mod store;
pub mod workspace;

// Re-export commonly used types
pub use event_store::EventStore;
pub use graph::{Failure, GraphError, NodeState};
pub use job::{Input, Job, Mapped, NodeHandle, Promise, Ready};
pub use scheduler::{
    classify, CancelHandle, NodeContext, RunOutput, Scheduler, SchedulerOptions, Services,
};
pub use shard::{fan_out, partition};
pub use store::{ArtifactStore, FsArtifactStore, StoreError};
pub use workspace::{mount_path, unique_name, StagedFile, Workspace, WorkspaceError};
