//! Identity and placement metadata for task-graph nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a node within one run's graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// How a node hangs off its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "position")]
pub enum Edge {
    /// Runs once the parent body has returned, alongside its siblings
    Child,

    /// Runs after the parent's whole subtree and every earlier follow-on
    FollowOn(usize),
}

/// Advisory resource needs for placing a node.
///
/// The scheduler records and logs these; it does not enforce them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceHint {
    /// Bytes of memory
    pub memory: u64,

    /// Bytes of local disk
    pub disk: u64,

    pub cores: u32,
}

impl ResourceHint {
    pub fn new(memory: u64, disk: u64, cores: u32) -> Self {
        Self {
            memory,
            disk,
            cores,
        }
    }

    /// Memory and disk as a multiple of total input size, one core
    pub fn scaled(input_bytes: u64, factor: u64) -> Self {
        let bytes = input_bytes.saturating_mul(factor);
        Self {
            memory: bytes,
            disk: bytes,
            cores: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_hint() {
        let hint = ResourceHint::scaled(1_000, 6);
        assert_eq!(hint.memory, 6_000);
        assert_eq!(hint.disk, 6_000);
        assert_eq!(hint.cores, 1);

        assert_eq!(ResourceHint::scaled(u64::MAX, 2).memory, u64::MAX);
    }

    #[test]
    fn test_edge_serialization() {
        let json = serde_json::to_string(&Edge::FollowOn(2)).unwrap();
        assert_eq!(json, r#"{"kind":"follow_on","position":2}"#);
    }
}
