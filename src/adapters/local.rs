//! Host-binary adapter.
//!
//! Runs tools installed on the host with the working directory as cwd.
//! Arguments that start with the mount prefix are rewritten to host paths.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{run_command, ToolAdapter, ToolError, ToolRef, DATA_MOUNT};

/// Tool adapter that runs host executables
#[derive(Debug, Clone, Default)]
pub struct LocalAdapter {
    /// Tool name -> executable; unmapped tools run by name from PATH
    programs: HashMap<String, String>,
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tool` via `program` instead of looking it up by name
    pub fn with_program(mut self, tool: impl Into<String>, program: impl Into<String>) -> Self {
        self.programs.insert(tool.into(), program.into());
        self
    }

    fn program_for<'a>(&'a self, tool: &'a ToolRef) -> &'a str {
        self.programs
            .get(&tool.name)
            .map(String::as_str)
            .unwrap_or(tool.name.as_str())
    }
}

/// Replace a leading mount prefix with the host working directory
fn rewrite_param(param: &str, work_dir: &Path) -> String {
    match param.strip_prefix(DATA_MOUNT) {
        Some(rest) => work_dir.join(rest).display().to_string(),
        None => param.to_string(),
    }
}

#[async_trait]
impl ToolAdapter for LocalAdapter {
    fn name(&self) -> &str {
        "local"
    }

    async fn invoke(
        &self,
        tool: &ToolRef,
        params: &[String],
        work_dir: &Path,
        stdout: Option<&Path>,
    ) -> Result<(), ToolError> {
        let program = self.program_for(tool);
        let args: Vec<String> = params.iter().map(|p| rewrite_param(p, work_dir)).collect();
        info!(tool = %tool.name, %program, ?args, "Running host tool");

        let mut command = Command::new(program);
        command.args(&args).current_dir(work_dir);
        run_command(&tool.name, command, stdout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rewrite_param() {
        let wd = Path::new("/tmp/ws-1");
        assert_eq!(rewrite_param("/data/ref.fa", wd), "/tmp/ws-1/ref.fa");
        assert_eq!(rewrite_param("mem", wd), "mem");
        assert_eq!(rewrite_param("/data", wd), "/data");
    }

    #[tokio::test]
    async fn test_stdout_goes_to_sink() {
        let temp = TempDir::new().unwrap();
        let sink = temp.path().join("out.txt");
        let adapter = LocalAdapter::new().with_program("echo-tool", "echo");
        let tool = ToolRef::new("echo-tool", "unused");

        adapter
            .invoke(&tool, &["hello".to_string()], temp.path(), Some(&sink))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&sink).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failed() {
        let temp = TempDir::new().unwrap();
        let adapter = LocalAdapter::new().with_program("nope", "false");
        let tool = ToolRef::new("nope", "unused");

        match adapter.invoke(&tool, &[], temp.path(), None).await {
            Err(ToolError::Failed { tool, code, .. }) => {
                assert_eq!(tool, "nope");
                assert_eq!(code, 1);
            }
            other => panic!("expected tool failure, got {:?}", other),
        }
    }
}
