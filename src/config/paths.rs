//! Engine directories.
//!
//! Home directory sources (highest priority first):
//! 1. `MARGINFLOW_HOME` environment variable
//! 2. `home` in the pipeline config
//! 3. `~/.marginflow`
//!
//! | Directory | Purpose |
//! |-----------|---------|
//! | `store/`  | Artifact blobs and records |
//! | `runs/`   | Per-run event logs and reports |
//! | `work/`   | Per-node workspaces |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable that overrides the engine home
pub const HOME_ENV: &str = "MARGINFLOW_HOME";

/// Resolved engine directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    pub home: PathBuf,
}

impl EnginePaths {
    /// Use `home` directly
    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Resolve from the environment, then `configured`, then the default
    pub fn resolve(configured: Option<&Path>) -> Result<Self> {
        if let Ok(env_home) = std::env::var(HOME_ENV) {
            if !env_home.trim().is_empty() {
                return Ok(Self::at(env_home));
            }
        }

        if let Some(home) = configured {
            return Ok(Self::at(home));
        }

        let home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".marginflow");
        Ok(Self::at(home))
    }

    /// Artifact store root ($MARGINFLOW_HOME/store)
    pub fn store_dir(&self) -> PathBuf {
        self.home.join("store")
    }

    /// Run logs ($MARGINFLOW_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Workspace root ($MARGINFLOW_HOME/work)
    pub fn work_dir(&self) -> PathBuf {
        self.home.join("work")
    }
}
