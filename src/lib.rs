//! marginflow - Task-graph orchestrator for nanopore alignment pipelines
//!
//! Runs a reference-index, align, chain, realign, train and call-variants
//! pipeline as a tree of dependent nodes. Each node stages the artifacts it
//! needs into a private workspace, runs an external tool there, and imports
//! the tool's output back into a content-addressed store.
//!
//! # Architecture
//!
//! - Nodes hang off their parent as children (run after the parent, in
//!   parallel with each other) or follow-ons (run after the parent's whole
//!   subtree, in order)
//! - Nodes pass values forward as promises, checked at construction time
//! - Every node transition is appended to a per-run event log
//!
//! # Modules
//!
//! - `adapters`: External tool invocation (docker, host binaries)
//! - `core`: Artifact store, workspaces, task graph and scheduler
//! - `domain`: Data structures (ArtifactId, Event, Run, RunReport)
//! - `pipeline`: The alignment stages
//! - `config`: Pipeline config and engine paths
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Write a starter config
//! marginflow generate --output pipeline.yaml
//!
//! # Run it
//! marginflow run --config pipeline.yaml
//!
//! # Check run status
//! marginflow status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod pipeline;

// Re-export main types at crate root for convenience
pub use config::{ConfigError, PipelineConfig};
pub use core::{FsArtifactStore, Job, NodeContext, Promise, Scheduler, SchedulerOptions, Services};
pub use domain::{ArtifactId, Event, EventType, Location, Run, RunReport, RunState};
pub use pipeline::Pipeline;
