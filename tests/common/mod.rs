//! Shared fixtures for the scheduler integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use marginflow::adapters::{ToolAdapter, ToolError, ToolRef};
use marginflow::core::{FsArtifactStore, SchedulerOptions, Services};
use marginflow::domain::Location;
use marginflow::PipelineConfig;
use tempfile::TempDir;

/// Adapter for graphs that never run a tool
pub struct NoTools;

#[async_trait]
impl ToolAdapter for NoTools {
    fn name(&self) -> &str {
        "none"
    }

    async fn invoke(
        &self,
        tool: &ToolRef,
        _params: &[String],
        _work_dir: &Path,
        _stdout: Option<&Path>,
    ) -> Result<(), ToolError> {
        Err(ToolError::Failed {
            tool: tool.name.clone(),
            code: 127,
            stderr: "no tools in this test".to_string(),
        })
    }
}

pub fn config() -> PipelineConfig {
    PipelineConfig::new(
        Location::file("/ref.fa"),
        Location::file("/reads.fq"),
        Location::file("/out.sam"),
    )
}

pub async fn services(temp: &TempDir) -> Arc<Services> {
    let store = FsArtifactStore::open(temp.path().join("store")).await.unwrap();
    Arc::new(Services {
        store: Arc::new(store),
        tools: Arc::new(NoTools),
        config: Arc::new(config()),
        work_root: temp.path().join("work"),
    })
}

pub fn options() -> SchedulerOptions {
    SchedulerOptions {
        max_parallel: 0,
        default_deadline: None,
        runs_dir: None,
    }
}

/// (node label, "start" | "end", when)
pub type Timeline = Arc<Mutex<Vec<(String, &'static str, Instant)>>>;

pub fn mark(timeline: &Timeline, label: &str, what: &'static str) {
    timeline
        .lock()
        .unwrap()
        .push((label.to_string(), what, Instant::now()));
}

pub fn when(timeline: &Timeline, label: &str, what: &str) -> Instant {
    timeline
        .lock()
        .unwrap()
        .iter()
        .find(|(l, w, _)| l == label && *w == what)
        .map(|(_, _, t)| *t)
        .unwrap_or_else(|| panic!("no {} mark for {}", what, label))
}
