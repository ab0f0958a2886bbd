//! Sharding Integration Tests
//!
//! Fan-out over partitioned records and fan-in in partition order.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{options, services};
use marginflow::core::{fan_out, partition, Job, Scheduler};
use tempfile::TempDir;
use tokio::time::sleep;

/// Records as (name, length)
fn records() -> Vec<(String, u64)> {
    (0..12)
        .map(|i| (format!("read{}", i), 100 + (i * 53 % 7) * 40))
        .collect()
}

struct Outcome {
    shards: usize,
    merged: String,
    finish_order: Vec<usize>,
}

/// Shard the records, upper-case each shard in its own node and join the
/// partial results in a follow-on. With `reversed`, earlier shards sleep
/// longer so they finish last.
async fn run_sharded(records: Vec<(String, u64)>, max: u64, reversed: bool) -> Outcome {
    let temp = TempDir::new().unwrap();
    let finish_order = Arc::new(Mutex::new(Vec::new()));
    let merged = Arc::new(Mutex::new(String::new()));
    let (finish_log, merged_sink) = (Arc::clone(&finish_order), Arc::clone(&merged));

    let root = Job::new("hub", (), move |ctx, ()| async move {
        let lengths: Vec<u64> = records.iter().map(|(_, len)| *len).collect();
        let ranges = partition(&lengths, max);
        let count = ranges.len();

        let parts = fan_out(&ctx, ranges, |k, range| {
            let shard = records[range].to_vec();
            let finish_log = Arc::clone(&finish_log);
            let delay = if reversed { (count - k) as u64 * 20 } else { 0 };
            Job::new(format!("shard-{}", k), (), move |_ctx, ()| async move {
                sleep(Duration::from_millis(delay)).await;
                finish_log.lock().unwrap().push(k);
                let names: Vec<String> = shard.iter().map(|(n, _)| n.to_uppercase()).collect();
                anyhow::Ok(names.join(","))
            })
        })?;

        ctx.add_follow_on(Job::new("merge", parts, move |_ctx, parts: Vec<String>| async move {
            *merged_sink.lock().unwrap() = parts.join(",");
            anyhow::Ok(())
        }))?;
        anyhow::Ok(count)
    });

    let output = Scheduler::new(services(&temp).await, options())
        .run(root)
        .await
        .unwrap();
    assert!(output.report.succeeded(), "{:?}", output.report.failures);
    assert_eq!(output.report.executed().last(), Some(&"merge"));

    let merged = merged.lock().unwrap().clone();
    let finish_order = finish_order.lock().unwrap().clone();
    Outcome {
        shards: output.value.unwrap(),
        merged,
        finish_order,
    }
}

#[tokio::test]
async fn test_merge_sees_partition_order_when_shards_finish_reversed() {
    let records = records();
    let expected: Vec<String> = records.iter().map(|(n, _)| n.to_uppercase()).collect();

    let outcome = run_sharded(records, 450, true).await;

    assert!(outcome.shards > 2);
    // Shards really did finish back to front
    assert_eq!(
        outcome.finish_order,
        (0..outcome.shards).rev().collect::<Vec<_>>()
    );
    assert_eq!(outcome.merged, expected.join(","));
}

#[tokio::test]
async fn test_sharded_result_matches_single_shard() {
    let sharded = run_sharded(records(), 300, true).await;
    let single = run_sharded(records(), u64::MAX, false).await;

    assert!(sharded.shards > 1);
    assert_eq!(single.shards, 1);
    assert_eq!(sharded.merged, single.merged);
}

#[tokio::test]
async fn test_no_records_means_no_shards() {
    let outcome = run_sharded(Vec::new(), 300, false).await;

    assert_eq!(outcome.shards, 0);
    assert!(outcome.merged.is_empty());
}
