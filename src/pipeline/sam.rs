//! Minimal SAM text handling for sharding.
//!
//! Only what the pipeline needs to cut an alignment into shards and put it
//! back together: header lines are kept verbatim and records are kept as
//! whole lines, measured by the length of their SEQ column.

use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::core::shard::partition;

/// SEQ is the tenth tab-separated column
const SEQ_COLUMN: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamError {
    #[error("SAM record on line {line} has {fields} fields, expected at least 11")]
    Truncated { line: usize, fields: usize },

    #[error("Header line {line} found after the first alignment record")]
    LateHeader { line: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamFile {
    pub header: Vec<String>,
    pub records: Vec<String>,
}

impl SamFile {
    pub fn parse(text: &str) -> Result<Self, SamError> {
        let mut sam = SamFile::default();

        for (i, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with('@') {
                if !sam.records.is_empty() {
                    return Err(SamError::LateHeader { line: i + 1 });
                }
                sam.header.push(line.to_string());
                continue;
            }

            let fields = line.split('\t').count();
            if fields < 11 {
                return Err(SamError::Truncated { line: i + 1, fields });
            }
            sam.records.push(line.to_string());
        }

        Ok(sam)
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read SAM file: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Malformed SAM file: {}", path.display()))
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_text())
            .await
            .with_context(|| format!("Failed to write SAM file: {}", path.display()))
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in self.header.iter().chain(&self.records) {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Read bases of each record; `*` counts as zero
    pub fn record_lengths(&self) -> Vec<u64> {
        self.records.iter().map(|r| seq_length(r)).collect()
    }

    pub fn total_bases(&self) -> u64 {
        self.record_lengths().iter().sum()
    }

    /// Record ranges of at most `max_bases` read bases each.
    ///
    /// An alignment without records still yields one (header-only) shard so
    /// the stages after it always have something to merge.
    pub fn shard_ranges(&self, max_bases: u64) -> Vec<Range<usize>> {
        let ranges = partition(&self.record_lengths(), max_bases);
        if ranges.is_empty() {
            vec![0..0]
        } else {
            ranges
        }
    }

    /// Header plus the records in `range`
    pub fn slice(&self, range: Range<usize>) -> SamFile {
        SamFile {
            header: self.header.clone(),
            records: self.records[range].to_vec(),
        }
    }

    /// Records in order until `max_bases` read bases have been taken
    pub fn sample(&self, max_bases: u64) -> SamFile {
        let mut taken = 0u64;
        let mut records = Vec::new();
        for record in &self.records {
            if taken >= max_bases {
                break;
            }
            taken = taken.saturating_add(seq_length(record));
            records.push(record.clone());
        }
        SamFile {
            header: self.header.clone(),
            records,
        }
    }

    /// Concatenate shards in the given order, keeping the first header
    pub fn merge(parts: &[SamFile]) -> SamFile {
        SamFile {
            header: parts.first().map(|p| p.header.clone()).unwrap_or_default(),
            records: parts.iter().flat_map(|p| p.records.iter().cloned()).collect(),
        }
    }
}

fn seq_length(record: &str) -> u64 {
    match record.split('\t').nth(SEQ_COLUMN) {
        Some("*") | None => 0,
        Some(seq) => seq.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, seq: &str) -> String {
        format!("{}\t0\tchr1\t1\t60\t{}M\t*\t0\t0\t{}\t*", name, seq.len(), seq)
    }

    fn sample_sam() -> SamFile {
        SamFile {
            header: vec!["@HD\tVN:1.5".to_string(), "@SQ\tSN:chr1\tLN:100".to_string()],
            records: vec![
                record("r1", "ACGTACGT"),
                record("r2", "ACG"),
                record("r3", "ACGTA"),
                record("r4", "AC"),
            ],
        }
    }

    #[test]
    fn test_parse_and_lengths() {
        let sam = SamFile::parse(&sample_sam().to_text()).unwrap();
        assert_eq!(sam.header.len(), 2);
        assert_eq!(sam.record_lengths(), vec![8, 3, 5, 2]);
        assert_eq!(sam.total_bases(), 18);
    }

    #[test]
    fn test_parse_rejects_short_record() {
        let err = SamFile::parse("@HD\tVN:1.5\nr1\t0\tchr1\n").unwrap_err();
        assert_eq!(err, SamError::Truncated { line: 2, fields: 3 });
    }

    #[test]
    fn test_shard_then_merge_is_identity() {
        let sam = sample_sam();
        let shards: Vec<SamFile> = sam
            .shard_ranges(8)
            .into_iter()
            .map(|r| sam.slice(r))
            .collect();

        assert_eq!(shards.len(), 3);
        assert!(shards.iter().all(|s| s.header == sam.header));
        assert_eq!(SamFile::merge(&shards), sam);
    }

    #[test]
    fn test_empty_alignment_has_one_shard() {
        let sam = SamFile {
            header: vec!["@HD\tVN:1.5".to_string()],
            records: Vec::new(),
        };
        assert_eq!(sam.shard_ranges(10), vec![0..0]);
    }

    #[test]
    fn test_sample_stops_at_limit() {
        let sam = sample_sam();
        assert_eq!(sam.sample(10).records.len(), 2);
        assert_eq!(sam.sample(0).records.len(), 0);
        assert_eq!(sam.sample(1000).records.len(), 4);
    }
}
