//! Stage, invoke, import.
//!
//! Every tool-running node does the same three things: materialize its
//! inputs into a fresh workspace, run the tool against that directory, and
//! import what the tool wrote back into the artifact store. [`ToolCall`]
//! does all of it and deletes the local files afterwards, whether or not
//! the tool succeeded.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::adapters::ToolRef;
use crate::core::{mount_path, unique_name, NodeContext, StagedFile, Workspace};
use crate::domain::{ArtifactId, Location};

use super::sam::SamFile;

/// Workspace mount paths for one invocation's inputs and outputs
pub struct Mounts<'a> {
    staged: &'a HashMap<ArtifactId, StagedFile>,
    outputs: &'a [String],
}

impl Mounts<'_> {
    /// Mount path of a staged input
    pub fn input(&self, id: ArtifactId) -> Result<String> {
        self.staged
            .get(&id)
            .map(StagedFile::mount_path)
            .with_context(|| format!("Artifact {} was not staged for this call", id))
    }

    /// Mount path of the i-th declared output file
    pub fn output(&self, index: usize) -> Result<String> {
        self.outputs
            .get(index)
            .map(|name| mount_path(name))
            .with_context(|| format!("No output declared at position {}", index))
    }
}

/// One external tool invocation
pub struct ToolCall {
    tool: ToolRef,
    inputs: Vec<ArtifactId>,
    names: HashMap<ArtifactId, String>,
    outputs: Vec<String>,
    stdout: Option<String>,
}

impl ToolCall {
    pub fn new(tool: ToolRef) -> Self {
        Self {
            tool,
            inputs: Vec::new(),
            names: HashMap::new(),
            outputs: Vec::new(),
            stdout: None,
        }
    }

    /// Stage `id` under a generated name
    pub fn input(mut self, id: ArtifactId) -> Self {
        self.inputs.push(id);
        self
    }

    pub fn inputs(mut self, ids: impl IntoIterator<Item = ArtifactId>) -> Self {
        self.inputs.extend(ids);
        self
    }

    /// Stage `id` under exactly `name`
    pub fn input_named(mut self, id: ArtifactId, name: impl Into<String>) -> Self {
        self.inputs.push(id);
        self.names.insert(id, name.into());
        self
    }

    /// A file the tool writes under `name`
    pub fn output_named(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// A file the tool writes, under a fresh name with `extension`
    pub fn output(self, extension: &str) -> Self {
        self.output_named(unique_name(extension))
    }

    /// Capture stdout into a fresh file with `extension`; imported first
    pub fn stdout(mut self, extension: &str) -> Self {
        self.stdout = Some(unique_name(extension));
        self
    }

    /// Run the tool and import its outputs.
    ///
    /// Returns the captured stdout (if any) followed by the declared
    /// outputs, in declaration order.
    pub async fn run<F>(self, ctx: &NodeContext, params: F) -> Result<Vec<ArtifactId>>
    where
        F: FnOnce(&Mounts<'_>) -> Result<Vec<String>>,
    {
        let mut workspace = ctx.workspace().await?;
        let staged = workspace.stage(&self.inputs, &self.names).await?;

        let mut produced: Vec<PathBuf> = self
            .stdout
            .iter()
            .chain(self.outputs.iter())
            .map(|name| workspace.path_of(name))
            .collect();

        let result = self.invoke_and_import(ctx, &workspace, &staged, &produced, params).await;

        produced.extend(staged.values().map(|f| f.path.clone()));
        cleanup(&workspace, &produced).await;
        result
    }

    async fn invoke_and_import<F>(
        &self,
        ctx: &NodeContext,
        workspace: &Workspace,
        staged: &HashMap<ArtifactId, StagedFile>,
        produced: &[PathBuf],
        params: F,
    ) -> Result<Vec<ArtifactId>>
    where
        F: FnOnce(&Mounts<'_>) -> Result<Vec<String>>,
    {
        let mounts = Mounts {
            staged,
            outputs: &self.outputs,
        };
        let params = params(&mounts)?;
        let stdout = self.stdout.as_ref().map(|name| workspace.path_of(name));

        let command = params.first().cloned().unwrap_or_default();
        debug!(tool = %self.tool, ?params, "Invoking tool");
        ctx.tools()
            .invoke(&self.tool, &params, workspace.working_directory(), stdout.as_deref())
            .await
            .with_context(|| format!("{} {} failed", self.tool.name, command))?;

        let mut ids = Vec::with_capacity(produced.len());
        for path in produced {
            ids.push(import_local(ctx, path.clone()).await?);
        }
        Ok(ids)
    }
}

/// Import a file from a workspace into the store
pub async fn import_local(ctx: &NodeContext, path: PathBuf) -> Result<ArtifactId> {
    let location = Location::file(path);
    let id = ctx
        .store()
        .import(&location)
        .await
        .with_context(|| format!("Failed to import tool output {}", location))?;
    debug!(artifact = %id, %location, "Imported output");
    Ok(id)
}

/// Delete local files, logging the ones that stay behind
pub async fn cleanup(workspace: &Workspace, paths: &[PathBuf]) {
    for (path, removed) in paths.iter().zip(workspace.safe_delete(paths).await) {
        if !removed {
            warn!(path = %path.display(), "Failed to remove local file");
        }
    }
}

/// Copy an artifact to its final destination
pub async fn export(ctx: &NodeContext, id: ArtifactId, destination: &Location) -> Result<()> {
    ctx.store()
        .export(id, destination)
        .await
        .with_context(|| format!("Failed to export {} to {}", id, destination))?;
    info!(artifact = %id, %destination, "Exported");
    Ok(())
}

/// Read an alignment artifact
async fn read_alignment(workspace: &mut Workspace, id: ArtifactId) -> Result<(SamFile, PathBuf)> {
    let staged = workspace.stage(&[id], &HashMap::new()).await?;
    let path = staged
        .get(&id)
        .map(|f| f.path.clone())
        .with_context(|| format!("Alignment {} was not staged", id))?;
    let sam = SamFile::read(&path).await?;
    Ok((sam, path))
}

/// Split an alignment into shards of at most `max_bases` read bases, each
/// imported as its own artifact, optionally sampling it first
pub async fn split_alignment(
    ctx: &NodeContext,
    alignment: ArtifactId,
    max_bases: u64,
    sample_bases: Option<u64>,
) -> Result<Vec<ArtifactId>> {
    let mut workspace = ctx.workspace().await?;
    let (sam, input_path) = read_alignment(&mut workspace, alignment).await?;
    let sam = match sample_bases {
        Some(limit) => sam.sample(limit),
        None => sam,
    };

    let ranges = sam.shard_ranges(max_bases);
    let mut written = vec![input_path];
    let mut shards = Vec::with_capacity(ranges.len());
    let result: Result<()> = async {
        for range in ranges {
            let (_, path) = workspace.output_path(".sam");
            written.push(path.clone());
            sam.slice(range).write(&path).await?;
            shards.push(import_local(ctx, path).await?);
        }
        Ok(())
    }
    .await;

    cleanup(&workspace, &written).await;
    result?;

    info!(
        alignment = %alignment,
        shards = shards.len(),
        bases = sam.total_bases(),
        "Split alignment"
    );
    Ok(shards)
}

/// Merge alignment shards in the given order, header once
pub async fn merge_alignments(ctx: &NodeContext, parts: &[ArtifactId]) -> Result<ArtifactId> {
    let mut workspace = ctx.workspace().await?;
    let mut written = Vec::with_capacity(parts.len() + 1);

    let result: Result<ArtifactId> = async {
        let mut shards = Vec::with_capacity(parts.len());
        for &part in parts {
            let (sam, path) = read_alignment(&mut workspace, part).await?;
            written.push(path);
            shards.push(sam);
        }

        let (_, out) = workspace.output_path(".sam");
        SamFile::merge(&shards).write(&out).await?;
        written.push(out.clone());
        import_local(ctx, out).await
    }
    .await;

    cleanup(&workspace, &written).await;
    result
}

/// Concatenate text artifacts in the given order
pub async fn concatenate(ctx: &NodeContext, parts: &[ArtifactId], extension: &str) -> Result<ArtifactId> {
    let mut workspace = ctx.workspace().await?;
    let staged = workspace.stage(parts, &HashMap::new()).await?;
    let mut written: Vec<PathBuf> = staged.values().map(|f| f.path.clone()).collect();

    let result: Result<ArtifactId> = async {
        let mut combined = Vec::new();
        for part in parts {
            let file = staged
                .get(part)
                .with_context(|| format!("Artifact {} was not staged", part))?;
            let bytes = tokio::fs::read(&file.path)
                .await
                .with_context(|| format!("Failed to read {}", file.path.display()))?;
            combined.extend_from_slice(&bytes);
        }

        let (_, out) = workspace.output_path(extension);
        tokio::fs::write(&out, &combined)
            .await
            .with_context(|| format!("Failed to write {}", out.display()))?;
        written.push(out.clone());
        import_local(ctx, out).await
    }
    .await;

    cleanup(&workspace, &written).await;
    result
}
