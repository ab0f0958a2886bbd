//! Adapter interfaces for external tools.
//!
//! Adapters run alignment and HMM tools against a single working directory.
//! The invoked process sees that directory as [`DATA_MOUNT`] and nothing
//! else, so stage code passes every file argument as a mount path.

pub mod docker;
pub mod local;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

pub use docker::DockerAdapter;
pub use local::LocalAdapter;

/// Where the working directory appears inside the tool's filesystem
pub const DATA_MOUNT: &str = "/data/";

/// Which tool to run and the image that provides it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRef {
    /// Short tool family name ("bwa", "margin")
    pub name: String,

    /// Container image reference
    pub image: String,
}

impl ToolRef {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

impl std::fmt::Display for ToolRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.image)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to start '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool '{tool}' failed with exit code {code}: {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("Tool I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Runs an external tool in a working directory
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Run `tool` with `params`, optionally capturing stdout into `stdout`.
    ///
    /// Non-zero exit is returned as [`ToolError::Failed`].
    async fn invoke(
        &self,
        tool: &ToolRef,
        params: &[String],
        work_dir: &Path,
        stdout: Option<&Path>,
    ) -> Result<(), ToolError>;
}

/// Spawn `command`, wait for it, and map the outcome to a [`ToolError`]
pub(crate) async fn run_command(
    label: &str,
    mut command: Command,
    stdout: Option<&Path>,
) -> Result<(), ToolError> {
    match stdout {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|source| ToolError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            command.stdout(Stdio::from(file));
        }
        None => {
            command.stdout(Stdio::null());
        }
    }

    let child = command
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolError::Spawn {
            tool: label.to_string(),
            source,
        })?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ToolError::Spawn {
            tool: label.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code().unwrap_or(-1);
        error!(tool = %label, code, "Tool exited with failure");
        return Err(ToolError::Failed {
            tool: label.to_string(),
            code,
            stderr,
        });
    }

    debug!(tool = %label, "Tool finished");
    Ok(())
}
