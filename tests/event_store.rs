//! Event Store Integration Tests
//!
//! Tests for event log format, concurrent appends, and replay.

use std::sync::Arc;

use marginflow::core::EventStore;
use marginflow::domain::{ErrorKind, Event, EventType, NodeId, NodeStatus, Run, RunState};
use tempfile::TempDir;
use uuid::Uuid;

fn node_event(run_id: Uuid, index: usize, name: &str, event_type: EventType, status: NodeStatus) -> Event {
    Event::node(
        run_id,
        NodeId::from_index(index),
        name,
        event_type,
        format!("{} {:?}", name, event_type),
        status,
    )
}

#[tokio::test]
async fn test_event_line_format() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

    let failed = node_event(run_id, 3, "realign-shard-0", EventType::NodeFailed, NodeStatus::Failed)
        .with_duration(1500)
        .with_error(ErrorKind::ToolFailed, "margin realign failed".to_string());
    store.append(&failed).await.unwrap();

    let content = std::fs::read_to_string(store.events_path()).unwrap();
    assert_eq!(content.lines().count(), 1);

    let json: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
    assert_eq!(json["event_type"], "node_failed");
    assert_eq!(json["status"], "failed");
    assert_eq!(json["error_kind"], "tool_failed");
    assert_eq!(json["node_name"], "realign-shard-0");
    assert_eq!(json["duration_ms"], 1500);
    assert!(json["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn test_concurrent_appends_stay_line_delimited() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = Arc::new(EventStore::open_in(temp.path(), run_id).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let name = format!("shard-{}", i);
            store
                .append(&node_event(run_id, i, &name, EventType::NodeCompleted, NodeStatus::Completed))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 16);
    assert!(events.iter().all(|e| e.run_id == run_id));
}

#[tokio::test]
async fn test_replay_of_interrupted_run() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

    store
        .append(&Event::run(
            run_id,
            EventType::RunStarted,
            "Run started".to_string(),
            NodeStatus::Running,
        ))
        .await
        .unwrap();
    store
        .append(&node_event(run_id, 0, "marginflow", EventType::NodeStarted, NodeStatus::Running))
        .await
        .unwrap();
    store
        .append(&node_event(run_id, 0, "marginflow", EventType::NodeCompleted, NodeStatus::Completed))
        .await
        .unwrap();
    store
        .append(&node_event(run_id, 1, "bwa-index", EventType::NodeStarted, NodeStatus::Running))
        .await
        .unwrap();

    let run = Run::from_events(&store.replay().await.unwrap()).unwrap();
    assert_eq!(run.state, RunState::Running);
    assert!(run.is_running());
    assert_eq!(run.count(NodeStatus::Running), 1);
    assert!(store.load_report().await.unwrap().is_none());

    let last = store
        .last_event_of_type(EventType::NodeStarted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.node_name.as_deref(), Some("bwa-index"));
}

#[tokio::test]
async fn test_list_runs_skips_foreign_directories() {
    let temp = TempDir::new().unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    EventStore::open_in(temp.path(), a).await.unwrap();
    EventStore::open_in(temp.path(), b).await.unwrap();
    std::fs::create_dir(temp.path().join("not-a-run")).unwrap();
    std::fs::write(temp.path().join(Uuid::new_v4().to_string()), "file, not dir").unwrap();

    let mut runs = EventStore::list_runs(temp.path()).await.unwrap();
    runs.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(runs, expected);

    let missing = EventStore::list_runs(&temp.path().join("nowhere")).await.unwrap();
    assert!(missing.is_empty());
}
