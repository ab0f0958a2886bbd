//! Append-only event store with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. Each run gets its own directory holding
//! `events.jsonl` and, once finished, `report.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Event, EventType, RunReport};

/// File-based event store using JSONL format
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Serialises appends from concurrently finishing nodes
    write_lock: Mutex<()>,
}

impl EventStore {
    /// Create or open the event store for a run under `runs_dir`
    pub async fn open_in(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Write the final run report next to the event log
    pub async fn store_report(&self, report: &RunReport) -> Result<PathBuf> {
        let report_path = self.run_dir.join("report.json");
        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;

        fs::write(&report_path, json)
            .await
            .with_context(|| format!("Failed to write report: {}", report_path.display()))?;

        Ok(report_path)
    }

    /// Load the final run report, if the run got that far
    pub async fn load_report(&self) -> Result<Option<RunReport>> {
        let report_path = self.run_dir.join("report.json");

        if !report_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&report_path)
            .await
            .with_context(|| format!("Failed to read report: {}", report_path.display()))?;

        let report = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse report: {}", report_path.display()))?;

        Ok(Some(report))
    }

    /// List all run IDs under `runs_dir`
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeId, NodeStatus};
    use tempfile::TempDir;

    async fn create_test_store() -> (EventStore, Uuid, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        (store, run_id, temp_dir)
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let (store, run_id, _temp) = create_test_store().await;

        let event1 = Event::run(
            run_id,
            EventType::RunStarted,
            "Run started".to_string(),
            NodeStatus::Running,
        );
        let event2 = Event::node(
            run_id,
            NodeId::from_index(0),
            "bwa",
            EventType::NodeStarted,
            "Node 'bwa' started".to_string(),
            NodeStatus::Running,
        );

        store.append(&event1).await.unwrap();
        store.append(&event2).await.unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].event_type, EventType::NodeStarted);
    }

    #[tokio::test]
    async fn test_event_replay_order() {
        let (store, run_id, _temp) = create_test_store().await;

        for i in 0..5 {
            let event = Event::node(
                run_id,
                NodeId::from_index(i),
                &format!("shard_{}", i),
                EventType::NodeStarted,
                format!("Shard {} started", i),
                NodeStatus::Running,
            );
            store.append(&event).await.unwrap();
        }

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 5);

        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.node_id, Some(NodeId::from_index(i)));
        }
    }

    #[tokio::test]
    async fn test_list_runs_ignores_stray_entries() {
        let temp = TempDir::new().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        EventStore::open_in(temp.path(), a).await.unwrap();
        EventStore::open_in(temp.path(), b).await.unwrap();
        std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "x").unwrap();

        let mut runs = EventStore::list_runs(temp.path()).await.unwrap();
        runs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(runs, expected);
    }

    #[tokio::test]
    async fn test_missing_report_is_none() {
        let (store, _run_id, _temp) = create_test_store().await;
        assert!(store.load_report().await.unwrap().is_none());
        assert!(store
            .last_event_of_type(EventType::RunCompleted)
            .await
            .unwrap()
            .is_none());
    }
}
