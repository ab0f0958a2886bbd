//! Fan-out / fan-in helpers.
//!
//! [`partition`] cuts an ordered sequence of record lengths into contiguous
//! shards, and [`fan_out`] adds one child per shard. The returned promises
//! are in shard order, so a follow-on that takes the `Vec` as input always
//! sees partial results in partition order whatever order they finished in.

use std::ops::Range;

use super::graph::GraphError;
use super::job::{Job, Promise};
use super::scheduler::NodeContext;

/// Split `lengths` into contiguous ranges whose sums stay within `max`.
///
/// A single length above `max` gets a range of its own. Ranges are
/// non-empty and cover every index in order; empty input gives no ranges.
pub fn partition(lengths: &[u64], max: u64) -> Vec<Range<usize>> {
    let mut shards = Vec::new();
    let mut start = 0;
    let mut total = 0u64;

    for (i, &len) in lengths.iter().enumerate() {
        if i > start && total.saturating_add(len) > max {
            shards.push(start..i);
            start = i;
            total = 0;
        }
        total = total.saturating_add(len);
    }

    if start < lengths.len() {
        shards.push(start..lengths.len());
    }

    shards
}

/// Add a child of `ctx` for every shard and collect their promises in order
pub fn fan_out<S, T, F>(
    ctx: &NodeContext,
    shards: impl IntoIterator<Item = S>,
    mut make_job: F,
) -> Result<Vec<Promise<T>>, GraphError>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(usize, S) -> Job<T>,
{
    shards
        .into_iter()
        .enumerate()
        .map(|(index, shard)| {
            let handle = ctx.add_child(make_job(index, shard))?;
            Ok(handle.promise())
        })
        .collect()
}
