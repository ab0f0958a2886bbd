//! Workspace Integration Tests
//!
//! Tests for staging artifacts under unique names, rollback and cleanup.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use marginflow::core::{ArtifactStore, FsArtifactStore, Workspace, WorkspaceError};
use marginflow::domain::{ArtifactId, Location};
use tempfile::TempDir;

async fn setup(temp: &TempDir, count: usize) -> (Arc<dyn ArtifactStore>, Vec<ArtifactId>) {
    let store = FsArtifactStore::open(temp.path().join("store")).await.unwrap();
    let mut ids = Vec::new();
    for i in 0..count {
        let path = temp.path().join(format!("input{}.txt", i));
        std::fs::write(&path, format!("content {}\n", i)).unwrap();
        ids.push(store.import(&Location::file(path)).await.unwrap());
    }
    (Arc::new(store), ids)
}

#[tokio::test]
async fn test_stage_generates_distinct_names() {
    let temp = TempDir::new().unwrap();
    let (store, ids) = setup(&temp, 6).await;
    let mut workspace = Workspace::create(&temp.path().join("work"), store).await.unwrap();

    let staged = workspace.stage(&ids, &HashMap::new()).await.unwrap();

    assert_eq!(staged.len(), ids.len());
    let names: HashSet<&str> = staged.values().map(|f| f.name.as_str()).collect();
    assert_eq!(names.len(), ids.len());

    for (i, id) in ids.iter().enumerate() {
        let file = &staged[id];
        assert_eq!(file.path.parent().unwrap(), workspace.working_directory());
        assert_eq!(
            std::fs::read_to_string(&file.path).unwrap(),
            format!("content {}\n", i)
        );
        assert!(file.mount_path().starts_with("/data/"));
    }
}

#[tokio::test]
async fn test_overrides_are_used_verbatim() {
    let temp = TempDir::new().unwrap();
    let (store, ids) = setup(&temp, 3).await;
    let mut workspace = Workspace::create(&temp.path().join("work"), store).await.unwrap();

    let overrides = HashMap::from([
        (ids[0], "ref1.fa".to_string()),
        (ids[1], "ref1.fa.amb".to_string()),
    ]);
    let staged = workspace.stage(&ids, &overrides).await.unwrap();

    assert_eq!(staged[&ids[0]].name, "ref1.fa");
    assert_eq!(staged[&ids[1]].name, "ref1.fa.amb");
    assert_eq!(staged[&ids[0]].mount_path(), "/data/ref1.fa");
    assert!(staged[&ids[2]].name.ends_with(".tmp"));
}

#[tokio::test]
async fn test_duplicate_name_touches_nothing() {
    let temp = TempDir::new().unwrap();
    let (store, ids) = setup(&temp, 2).await;
    let mut workspace = Workspace::create(&temp.path().join("work"), store).await.unwrap();

    let overrides = HashMap::from([
        (ids[0], "same.sam".to_string()),
        (ids[1], "same.sam".to_string()),
    ]);
    let err = workspace.stage(&ids, &overrides).await.unwrap_err();

    assert!(matches!(err, WorkspaceError::DuplicateName { ref name, .. } if name == "same.sam"));
    let entries = std::fs::read_dir(workspace.working_directory()).unwrap().count();
    assert_eq!(entries, 0);
}

#[tokio::test]
async fn test_failed_materialization_rolls_back() {
    let temp = TempDir::new().unwrap();
    let (store, mut ids) = setup(&temp, 3).await;
    let unknown = ArtifactId::new();
    ids.push(unknown);

    let mut workspace = Workspace::create(&temp.path().join("work"), store).await.unwrap();
    let err = workspace.stage(&ids, &HashMap::new()).await.unwrap_err();

    match err {
        WorkspaceError::StageFailed { id, .. } => assert_eq!(id, unknown),
        other => panic!("expected StageFailed, got {:?}", other),
    }
    let entries = std::fs::read_dir(workspace.working_directory()).unwrap().count();
    assert_eq!(entries, 0);
}

#[tokio::test]
async fn test_safe_delete_removes_staged_files() {
    let temp = TempDir::new().unwrap();
    let (store, ids) = setup(&temp, 4).await;
    let mut workspace = Workspace::create(&temp.path().join("work"), store).await.unwrap();

    let staged = workspace.stage(&ids, &HashMap::new()).await.unwrap();
    let paths: Vec<PathBuf> = staged.values().map(|f| f.path.clone()).collect();

    let removed = workspace.safe_delete(&paths).await;
    assert_eq!(removed, vec![true; paths.len()]);
    assert!(paths.iter().all(|p| !p.exists()));

    // Deleting again still reports the post-condition
    assert_eq!(workspace.safe_delete(&paths).await, vec![true; paths.len()]);
}

#[tokio::test]
async fn test_concurrent_workspaces_do_not_share_directories() {
    let temp = TempDir::new().unwrap();
    let (store, _) = setup(&temp, 0).await;
    let root = temp.path().join("work");

    let a = Workspace::create(&root, Arc::clone(&store)).await.unwrap();
    let b = Workspace::create(&root, store).await.unwrap();
    assert_ne!(a.working_directory(), b.working_directory());

    let dir = a.working_directory().to_path_buf();
    a.close().unwrap();
    assert!(!dir.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_workspaces_created_at_once() {
    let temp = TempDir::new().unwrap();
    let (store, _) = setup(&temp, 0).await;
    let root = temp.path().join("work");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let (root, store) = (root.clone(), Arc::clone(&store));
        tasks.push(tokio::spawn(async move { Workspace::create(&root, store).await }));
    }

    let mut workspaces = Vec::new();
    for task in tasks {
        workspaces.push(task.await.unwrap().unwrap());
    }
    let dirs: HashSet<PathBuf> = workspaces
        .iter()
        .map(|w| w.working_directory().to_path_buf())
        .collect();
    assert_eq!(dirs.len(), 16);
    assert!(dirs.iter().all(|d| d.is_dir() && d.starts_with(&root)));
}
