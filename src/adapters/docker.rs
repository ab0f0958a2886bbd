//! Docker adapter for containerized tools.
//!
//! Spawns `docker run --rm -v <work_dir>:/data -w /data <image> <params...>`,
//! so the container sees only the working directory.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{run_command, ToolAdapter, ToolError, ToolRef, DATA_MOUNT};

/// Tool adapter backed by the docker CLI
pub struct DockerAdapter {
    /// Path to the docker binary (default: "docker")
    binary_path: String,
}

impl Default for DockerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerAdapter {
    pub fn new() -> Self {
        Self {
            binary_path: "docker".to_string(),
        }
    }

    /// Use a custom docker binary (podman, a wrapper script, ...)
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Full argument list passed to the docker binary
    fn arguments(&self, tool: &ToolRef, params: &[String], work_dir: &Path) -> Vec<String> {
        let mount = DATA_MOUNT.trim_end_matches('/');
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{}", work_dir.display(), mount),
            "-w".to_string(),
            mount.to_string(),
            tool.image.clone(),
        ];
        args.extend(params.iter().cloned());
        args
    }
}

#[async_trait]
impl ToolAdapter for DockerAdapter {
    fn name(&self) -> &str {
        "docker"
    }

    async fn invoke(
        &self,
        tool: &ToolRef,
        params: &[String],
        work_dir: &Path,
        stdout: Option<&Path>,
    ) -> Result<(), ToolError> {
        let args = self.arguments(tool, params, work_dir);
        info!(tool = %tool.name, image = %tool.image, ?params, "Running container");

        let mut command = Command::new(&self.binary_path);
        command.args(&args);
        run_command(&tool.name, command, stdout).await
    }
}
