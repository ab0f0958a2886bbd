//! Content-addressed artifact store.
//!
//! Every file that enters a run is imported once and referred to by an
//! opaque [`ArtifactId`] from then on. The filesystem store keeps one blob
//! per distinct content (keyed by SHA-256) and one small JSON record per
//! id, so two imports of the same bytes get two ids but share storage.
//! Sources are local files or `http(s)://` URLs; both stream through the
//! same hashing ingest.
//!
//! Layout under the store root:
//! - `blobs/<sha256>`: content
//! - `records/<id>.json`: [`ArtifactRecord`]
//! - `tmp/`: in-flight imports

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{ArtifactId, ArtifactRecord, Location};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Import source not found: {0}")]
    NotFound(Location),

    #[error("Unknown artifact: {0}")]
    MissingArtifact(ArtifactId),

    #[error("Unsupported location scheme '{scheme}' for {location}")]
    UnsupportedScheme { scheme: String, location: Location },

    #[error("Failed to fetch {location}: {source}")]
    Fetch {
        location: Location,
        #[source]
        source: reqwest::Error,
    },

    #[error("Fetching {location} returned HTTP {status}")]
    HttpStatus { location: Location, status: u16 },

    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt artifact record {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persistent home for artifact bytes
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Copy external content in and mint a new id for it
    async fn import(&self, source: &Location) -> Result<ArtifactId, StoreError>;

    /// Write the artifact's bytes to a local path
    async fn materialize(&self, id: ArtifactId, destination: &Path) -> Result<(), StoreError>;

    /// Copy the artifact to a caller-visible location
    async fn export(&self, id: ArtifactId, destination: &Location) -> Result<(), StoreError>;

    /// Size in bytes, for resource hints
    async fn size_of(&self, id: ArtifactId) -> Result<u64, StoreError>;

    /// Full metadata for an id
    async fn record(&self, id: ArtifactId) -> Result<ArtifactRecord, StoreError>;
}

/// Filesystem-backed [`ArtifactStore`]
pub struct FsArtifactStore {
    root: PathBuf,
    index: RwLock<HashMap<ArtifactId, ArtifactRecord>>,
    client: reqwest::Client,
}

/// A temp file being filled and hashed
struct Ingest {
    tmp_path: PathBuf,
    output: File,
    hasher: Sha256,
    size: u64,
}

impl Ingest {
    async fn start(tmp_dir: &Path) -> Result<Self, StoreError> {
        let tmp_path = tmp_dir.join(Uuid::new_v4().simple().to_string());
        let output = File::create(&tmp_path).await.map_err(io_err(&tmp_path))?;
        Ok(Self {
            tmp_path,
            output,
            hasher: Sha256::new(),
            size: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.hasher.update(chunk);
        self.output
            .write_all(chunk)
            .await
            .map_err(io_err(&self.tmp_path))?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// (temp path, digest, size)
    async fn finish(mut self) -> Result<(PathBuf, String, u64), StoreError> {
        self.output.flush().await.map_err(io_err(&self.tmp_path))?;
        Ok((self.tmp_path, hex::encode(self.hasher.finalize()), self.size))
    }

    async fn abort(self) {
        drop(self.output);
        if let Err(e) = fs::remove_file(&self.tmp_path).await {
            warn!(path = %self.tmp_path.display(), error = %e, "Failed to remove partial import");
        }
    }
}

impl FsArtifactStore {
    /// Open (or create) a store rooted at `root`, loading existing records
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["blobs", "records", "tmp"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).await.map_err(io_err(&path))?;
        }

        let records_dir = root.join("records");
        let mut index = HashMap::new();
        let mut entries = fs::read_dir(&records_dir)
            .await
            .map_err(io_err(&records_dir))?;

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&records_dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await.map_err(io_err(&path))?;
            let record: ArtifactRecord =
                serde_json::from_str(&content).map_err(|source| StoreError::Record {
                    path: path.clone(),
                    source,
                })?;
            index.insert(record.id, record);
        }

        debug!(root = %root.display(), artifacts = index.len(), "Opened artifact store");

        Ok(Self {
            root,
            index: RwLock::new(index),
            client: reqwest::Client::new(),
        })
    }

    /// Use `client` for `http(s)://` imports
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of known artifacts
    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(digest)
    }

    fn lookup(&self, id: ArtifactId) -> Result<ArtifactRecord, StoreError> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(StoreError::MissingArtifact(id))
    }

    /// Stream a local file into a temp file, returning (temp path, digest, size)
    async fn ingest_file(
        &self,
        source: &Location,
        path: &Path,
    ) -> Result<(PathBuf, String, u64), StoreError> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(StoreError::NotFound(source.clone())),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(StoreError::NotFound(source.clone()))
            }
            Err(e) => return Err(io_err(path)(e)),
        }

        let mut input = File::open(path).await.map_err(io_err(path))?;
        let mut ingest = Ingest::start(&self.root.join("tmp")).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match input.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    ingest.abort().await;
                    return Err(io_err(path)(e));
                }
            };
            ingest.write(&buf[..n]).await?;
        }
        ingest.finish().await
    }

    /// Stream an HTTP(S) response body into a temp file
    async fn ingest_url(&self, source: &Location, url: &str) -> Result<(PathBuf, String, u64), StoreError> {
        let fetch_err = |source_err| StoreError::Fetch {
            location: source.clone(),
            source: source_err,
        };

        let mut response = self.client.get(url).send().await.map_err(fetch_err)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(StoreError::NotFound(source.clone()));
        }
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                location: source.clone(),
                status: status.as_u16(),
            });
        }
        debug!(url, length = ?response.content_length(), "Fetching remote artifact");

        let mut ingest = Ingest::start(&self.root.join("tmp")).await?;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => ingest.write(&chunk).await?,
                Ok(None) => break,
                Err(e) => {
                    ingest.abort().await;
                    return Err(fetch_err(e));
                }
            }
        }
        ingest.finish().await
    }

    async fn write_record(&self, record: &ArtifactRecord) -> Result<(), StoreError> {
        let path = self.root.join("records").join(format!("{}.json", record.id));
        let tmp_path = self.root.join("tmp").join(format!("{}.json", record.id));

        let json = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Record {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp_path, json).await.map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &path).await.map_err(io_err(&path))?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    #[instrument(skip(self, source), fields(source = %source))]
    async fn import(&self, source: &Location) -> Result<ArtifactId, StoreError> {
        let (tmp_path, digest, size) = match source {
            Location::File(path) => self.ingest_file(source, path).await?,
            Location::Remote(url) if matches!(source.scheme(), "http" | "https") => {
                self.ingest_url(source, url).await?
            }
            Location::Remote(_) => {
                return Err(StoreError::UnsupportedScheme {
                    scheme: source.scheme().to_string(),
                    location: source.clone(),
                })
            }
        };

        let blob = self.blob_path(&digest);
        if fs::try_exists(&blob).await.map_err(io_err(&blob))? {
            fs::remove_file(&tmp_path).await.map_err(io_err(&tmp_path))?;
        } else {
            fs::rename(&tmp_path, &blob).await.map_err(io_err(&blob))?;
        }

        let record = ArtifactRecord {
            id: ArtifactId::new(),
            digest,
            size,
            source: source.clone(),
            imported_at: Utc::now(),
        };
        self.write_record(&record).await?;

        let id = record.id;
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, record);

        info!(artifact = %id, size, "Imported artifact");
        Ok(id)
    }

    async fn materialize(&self, id: ArtifactId, destination: &Path) -> Result<(), StoreError> {
        let record = self.lookup(id)?;
        let blob = self.blob_path(&record.digest);

        // Copy rather than link so tools may rewrite staged files in place
        fs::copy(&blob, destination)
            .await
            .map_err(io_err(destination))?;

        debug!(artifact = %id, destination = %destination.display(), "Materialized artifact");
        Ok(())
    }

    #[instrument(skip(self, id, destination), fields(artifact = %id, destination = %destination))]
    async fn export(&self, id: ArtifactId, destination: &Location) -> Result<(), StoreError> {
        let record = self.lookup(id)?;

        let path = match destination {
            Location::File(path) => path,
            Location::Remote(_) => {
                return Err(StoreError::UnsupportedScheme {
                    scheme: destination.scheme().to_string(),
                    location: destination.clone(),
                })
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }

        let blob = self.blob_path(&record.digest);
        fs::copy(&blob, path).await.map_err(io_err(path))?;

        info!(size = record.size, "Exported artifact");
        Ok(())
    }

    async fn size_of(&self, id: ArtifactId) -> Result<u64, StoreError> {
        Ok(self.lookup(id)?.size)
    }

    async fn record(&self, id: ArtifactId) -> Result<ArtifactRecord, StoreError> {
        self.lookup(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_identical_content_shares_blob() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path().join("store")).await.unwrap();

        let a = temp.path().join("a.fa");
        let b = temp.path().join("b.fa");
        std::fs::write(&a, ">chr1\nACGT\n").unwrap();
        std::fs::write(&b, ">chr1\nACGT\n").unwrap();

        let id_a = store.import(&Location::file(&a)).await.unwrap();
        let id_b = store.import(&Location::file(&b)).await.unwrap();
        assert_ne!(id_a, id_b);

        let rec_a = store.record(id_a).await.unwrap();
        let rec_b = store.record(id_b).await.unwrap();
        assert_eq!(rec_a.digest, rec_b.digest);
        assert_eq!(rec_a.size, 11);

        let blobs = std::fs::read_dir(store.root().join("blobs")).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[tokio::test]
    async fn test_directory_source_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path().join("store")).await.unwrap();

        let err = store
            .import(&Location::file(temp.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remote_import_unsupported() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::open(temp.path()).await.unwrap();

        let remote: Location = "s3://bucket/reads.fq".parse().unwrap();
        match store.import(&remote).await {
            Err(StoreError::UnsupportedScheme { scheme, .. }) => assert_eq!(scheme, "s3"),
            other => panic!("expected unsupported scheme, got {:?}", other),
        }
    }
}
