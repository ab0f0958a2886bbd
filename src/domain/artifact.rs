//! Artifacts tracked by the store.
//!
//! An artifact is an immutable unit of file content. Stages never see paths
//! into the store, only opaque [`ArtifactId`]s that they stage into a local
//! workspace when an external tool needs the bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier minted once per import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    /// Mint a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (used when reloading records)
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ArtifactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where artifact bytes come from or go to.
///
/// `file://` URLs and bare paths are local; any other `scheme://` is kept
/// verbatim and left to the store implementation to interpret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Location {
    /// Local filesystem path
    File(PathBuf),

    /// Remote URL (s3://, http://, ...)
    Remote(String),
}

impl Location {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Local path if this is a file location
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Location::File(path) => Some(path),
            Location::Remote(_) => None,
        }
    }

    /// URL scheme ("file" for local paths)
    pub fn scheme(&self) -> &str {
        match self {
            Location::File(_) => "file",
            Location::Remote(url) => url.split_once("://").map(|(s, _)| s).unwrap_or(""),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::File(path) => write!(f, "file://{}", path.display()),
            Location::Remote(url) => write!(f, "{}", url),
        }
    }
}

impl FromStr for Location {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocationError::Empty);
        }

        if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(LocationError::Empty);
            }
            return Ok(Location::File(PathBuf::from(path)));
        }

        match s.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {
                Ok(Location::Remote(s.to_string()))
            }
            Some(_) => Err(LocationError::Malformed(s.to_string())),
            None => Ok(Location::File(PathBuf::from(s))),
        }
    }
}

impl TryFrom<String> for Location {
    type Error = LocationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Location> for String {
    fn from(location: Location) -> Self {
        location.to_string()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("Empty location")]
    Empty,

    #[error("Malformed location URL: {0}")]
    Malformed(String),
}

/// Persisted metadata for one artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: ArtifactId,

    /// Hex SHA-256 of the content; also the blob key
    pub digest: String,

    /// Size in bytes
    pub size: u64,

    /// Where the bytes were imported from
    pub source: Location,

    pub imported_at: DateTime<Utc>,
}

/// Files `bwa index` writes next to a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSuffix {
    Amb,
    Ann,
    Bwt,
    Pac,
    Sa,
}

impl IndexSuffix {
    pub const ALL: [IndexSuffix; 5] = [
        IndexSuffix::Amb,
        IndexSuffix::Ann,
        IndexSuffix::Bwt,
        IndexSuffix::Pac,
        IndexSuffix::Sa,
    ];

    /// File suffix including the leading dot
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexSuffix::Amb => ".amb",
            IndexSuffix::Ann => ".ann",
            IndexSuffix::Bwt => ".bwt",
            IndexSuffix::Pac => ".pac",
            IndexSuffix::Sa => ".sa",
        }
    }
}

impl fmt::Display for IndexSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index artifacts derived from one reference, keyed by suffix.
///
/// Only constructible with every suffix present, so a family either exists
/// whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FamilyParts")]
pub struct ArtifactFamily {
    source: ArtifactId,
    members: BTreeMap<IndexSuffix, ArtifactId>,
}

/// Unchecked wire form of [`ArtifactFamily`]
#[derive(Deserialize)]
struct FamilyParts {
    source: ArtifactId,
    members: BTreeMap<IndexSuffix, ArtifactId>,
}

impl TryFrom<FamilyParts> for ArtifactFamily {
    type Error = FamilyError;

    fn try_from(parts: FamilyParts) -> Result<Self, Self::Error> {
        Self::from_members(parts.source, parts.members)
    }
}

impl ArtifactFamily {
    pub fn from_members(
        source: ArtifactId,
        members: impl IntoIterator<Item = (IndexSuffix, ArtifactId)>,
    ) -> Result<Self, FamilyError> {
        let mut map = BTreeMap::new();
        for (suffix, id) in members {
            if map.insert(suffix, id).is_some() {
                return Err(FamilyError::Duplicate(suffix));
            }
        }

        let missing: Vec<IndexSuffix> = IndexSuffix::ALL
            .into_iter()
            .filter(|s| !map.contains_key(s))
            .collect();
        if !missing.is_empty() {
            return Err(FamilyError::Incomplete {
                reference: source,
                missing,
            });
        }

        Ok(Self {
            source,
            members: map,
        })
    }

    /// The artifact the family was built from
    pub fn source(&self) -> ArtifactId {
        self.source
    }

    pub fn get(&self, suffix: IndexSuffix) -> ArtifactId {
        // from_members guarantees every suffix is present
        self.members[&suffix]
    }

    pub fn iter(&self) -> impl Iterator<Item = (IndexSuffix, ArtifactId)> + '_ {
        self.members.iter().map(|(s, id)| (*s, *id))
    }

    pub fn ids(&self) -> Vec<ArtifactId> {
        self.members.values().copied().collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FamilyError {
    #[error("Index family for {reference} is missing {missing:?}")]
    Incomplete {
        reference: ArtifactId,
        missing: Vec<IndexSuffix>,
    },

    #[error("Index suffix {0} given twice")]
    Duplicate(IndexSuffix),
}
