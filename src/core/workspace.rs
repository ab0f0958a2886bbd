//! Per-node local workspace.
//!
//! A [`Workspace`] is one flat directory into which a node stages the
//! artifacts an external tool needs. Names are either generated (random
//! token plus extension) or given explicitly when the tool expects a naming
//! convention, such as index files sitting next to their reference. The
//! directory is removed when the workspace is dropped.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::DATA_MOUNT;
use crate::domain::ArtifactId;

use super::store::{ArtifactStore, StoreError};

/// Extension for generated names when the caller has no preference
pub const DEFAULT_EXTENSION: &str = ".tmp";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Staged name '{name}' claimed by both {first} and {second}")]
    DuplicateName {
        name: String,
        first: ArtifactId,
        second: ArtifactId,
    },

    #[error("Invalid staged name '{0}': must be a plain file name")]
    InvalidName(String),

    #[error("Failed to stage {id}: {source}")]
    StageFailed {
        id: ArtifactId,
        #[source]
        source: StoreError,
    },

    #[error("Workspace I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An artifact materialized into the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Absolute path on the host
    pub path: PathBuf,

    /// File name relative to the working directory
    pub name: String,
}

impl StagedFile {
    /// Path as the invoked tool sees it
    pub fn mount_path(&self) -> String {
        mount_path(&self.name)
    }
}

/// Path under the tool mount for a workspace file name
pub fn mount_path(name: &str) -> String {
    format!("{}{}", DATA_MOUNT, name)
}

/// Random file name with the given extension (include the dot)
pub fn unique_name(extension: &str) -> String {
    format!("{}{}", Uuid::new_v4().simple(), extension)
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Shared list of artifact ids staged on behalf of one node
pub type StagedInputs = Arc<Mutex<Vec<ArtifactId>>>;

/// One node's local working directory
pub struct Workspace {
    dir: TempDir,
    store: Arc<dyn ArtifactStore>,

    /// File name -> id, across every stage call
    names: HashMap<String, ArtifactId>,

    staged: Option<StagedInputs>,
}

impl Workspace {
    /// Create a fresh, uniquely named directory under `root`
    pub async fn create(root: &Path, store: Arc<dyn ArtifactStore>) -> Result<Self, WorkspaceError> {
        let io_error = |source| WorkspaceError::Io {
            path: root.to_path_buf(),
            source,
        };
        fs::create_dir_all(root).await.map_err(io_error)?;

        // tempfile has no async API; keep its blocking mkdir off the runtime
        let parent = root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix("ws-").tempdir_in(parent)
        })
        .await
        .map_err(|e| io_error(std::io::Error::new(IoErrorKind::Other, e)))?
        .map_err(io_error)?;

        debug!(dir = %dir.path().display(), "Created workspace");

        Ok(Self {
            dir,
            store,
            names: HashMap::new(),
            staged: None,
        })
    }

    /// Record every staged id into `staged` as well
    pub fn with_recorder(mut self, staged: StagedInputs) -> Self {
        self.staged = Some(staged);
        self
    }

    /// The single directory every staged file lives in
    pub fn working_directory(&self) -> &Path {
        self.dir.path()
    }

    /// Fresh output name and its host path
    pub fn output_path(&self, extension: &str) -> (String, PathBuf) {
        let name = unique_name(extension);
        let path = self.dir.path().join(&name);
        (name, path)
    }

    /// Host path for a name in this workspace
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Materialize `ids` into the working directory.
    ///
    /// Ids named in `overrides` keep that name verbatim; the rest get a
    /// generated `<token>.tmp` name. Fails without touching the disk if two
    /// ids would share a name, and removes this call's files if any
    /// materialization fails.
    pub async fn stage(
        &mut self,
        ids: &[ArtifactId],
        overrides: &HashMap<ArtifactId, String>,
    ) -> Result<HashMap<ArtifactId, StagedFile>, WorkspaceError> {
        let mut planned: Vec<(ArtifactId, String)> = Vec::with_capacity(ids.len());
        let mut claimed: HashMap<String, ArtifactId> = HashMap::new();
        let mut result = HashMap::new();

        for &id in ids {
            if planned.iter().any(|(seen, _)| *seen == id) || result.contains_key(&id) {
                continue;
            }

            let name = match overrides.get(&id) {
                Some(name) => {
                    if !valid_name(name) {
                        return Err(WorkspaceError::InvalidName(name.clone()));
                    }
                    name.clone()
                }
                None => unique_name(DEFAULT_EXTENSION),
            };

            match self.names.get(&name).or_else(|| claimed.get(&name)) {
                Some(&existing) if existing == id => {
                    // Already staged under this name by an earlier call
                    result.insert(
                        id,
                        StagedFile {
                            path: self.path_of(&name),
                            name,
                        },
                    );
                    continue;
                }
                Some(&existing) => {
                    return Err(WorkspaceError::DuplicateName {
                        name,
                        first: existing,
                        second: id,
                    });
                }
                None => {}
            }

            claimed.insert(name.clone(), id);
            planned.push((id, name));
        }

        let mut created: Vec<PathBuf> = Vec::with_capacity(planned.len());
        for (id, name) in &planned {
            let path = self.path_of(name);
            if let Err(source) = self.store.materialize(*id, &path).await {
                warn!(artifact = %id, error = %source, "Staging failed, rolling back");
                created.push(path);
                for (path, ok) in created.iter().zip(self.safe_delete(&created).await) {
                    if !ok {
                        warn!(path = %path.display(), "Rollback could not remove staged file");
                    }
                }
                return Err(WorkspaceError::StageFailed { id: *id, source });
            }
            created.push(path);
        }

        for (id, name) in planned {
            self.names.insert(name.clone(), id);
            result.insert(
                id,
                StagedFile {
                    path: self.path_of(&name),
                    name,
                },
            );
        }

        if let Some(staged) = &self.staged {
            let mut staged = staged.lock().unwrap_or_else(|e| e.into_inner());
            for id in result.keys() {
                if !staged.contains(id) {
                    staged.push(*id);
                }
            }
        }

        debug!(count = result.len(), "Staged artifacts");
        Ok(result)
    }

    /// Delete each path, reporting whether it is gone afterwards.
    ///
    /// A `false` entry means the file could not be removed; callers log it
    /// and carry on.
    pub async fn safe_delete(&self, paths: &[PathBuf]) -> Vec<bool> {
        let mut results = Vec::with_capacity(paths.len());

        for path in paths {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {
                    warn!(path = %path.display(), "Asked to delete a file that does not exist");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete file");
                }
            }

            // An unreadable path counts as still present
            let gone = !fs::try_exists(path).await.unwrap_or(true);
            results.push(gone);
        }

        results
    }

    /// Remove the directory now, surfacing any error
    pub fn close(self) -> Result<(), WorkspaceError> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|source| WorkspaceError::Io { path, source })
    }
}
