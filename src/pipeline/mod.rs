//! The alignment pipeline.
//!
//! [`Pipeline::run`] validates a config, imports its inputs and builds one
//! root node that lays out the stages the config enables:
//!
//! ```text
//! marginflow
//! ├── bwa-index                (child)
//! ├── bwa-align                (follow-on, uses the index)
//! ├── chain                    (follow-on, unless no_chain)
//! ├── em | realign             (follow-on, unless no_realign)
//! │     └── ... shards, merge, export-alignment, variants
//! └── export-alignment         (follow-on, only with no_realign)
//! ```

pub mod bwa;
pub mod margin;
pub mod sam;
pub mod stage;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::adapters::ToolAdapter;
use crate::config::PipelineConfig;
use crate::core::{
    ArtifactStore, CancelHandle, Input, Job, NodeContext, Ready, Scheduler, SchedulerOptions,
    Services,
};
use crate::domain::{ArtifactId, Location, RunReport};

use margin::ReadSet;

pub const ROOT_NODE: &str = "marginflow";
pub const EXPORT_ALIGNMENT_NODE: &str = "export-alignment";

/// Memory per input byte for alignment and index building
const BWA_MEMORY_FACTOR: u64 = 2;

/// Imported pipeline inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineInputs {
    pub reference: ArtifactId,
    pub reads: ArtifactId,

    /// Input model, if one was given
    pub model: Option<ArtifactId>,
}

/// Copy an artifact to `destination` once it exists
pub fn export_job<I>(name: &str, artifact: I, destination: Location) -> Job<()>
where
    I: Input<Value = ArtifactId>,
{
    Job::new(name, (Ready(destination), artifact), |ctx, (destination, artifact)| async move {
        stage::export(&ctx, artifact, &destination).await
    })
}

/// The root node for `inputs`
pub fn root_job(inputs: PipelineInputs) -> Job<()> {
    Job::new(ROOT_NODE, Ready(inputs), plan)
}

async fn plan(ctx: NodeContext, inputs: PipelineInputs) -> Result<()> {
    let config = ctx.config().clone();
    let reads = ReadSet {
        reference: inputs.reference,
        reads: inputs.reads,
    };

    let index_hint = ctx
        .resources_for(&[inputs.reference], BWA_MEMORY_FACTOR)
        .await?;
    let align_hint = ctx
        .resources_for(&[inputs.reference, inputs.reads], BWA_MEMORY_FACTOR)
        .await?;
    let index = ctx.add_child(bwa::index_job(inputs.reference, index_hint))?;
    let aligned = ctx.add_follow_on(bwa::align_job(
        inputs.reference,
        inputs.reads,
        index.promise(),
        align_hint,
    ))?;

    let mut alignment = aligned.promise();
    if !config.no_chain {
        let chained = ctx.add_follow_on(margin::chain_job(reads, alignment))?;
        alignment = chained.promise();
    }

    if !config.realigns() {
        ctx.add_follow_on(export_job(
            EXPORT_ALIGNMENT_NODE,
            alignment.clone(),
            config.output_sam_path.clone(),
        ))?;
        if config.call_variants {
            let model = inputs
                .model
                .context("Variant calling needs an input model when realignment is off")?;
            ctx.add_follow_on(margin::variants_job(reads, alignment, model))?;
        }
    } else if config.em {
        ctx.add_follow_on(margin::em_job(reads, alignment, inputs.model))?;
    } else {
        let model = inputs
            .model
            .context("HMM realignment needs an input model")?;
        ctx.add_follow_on(margin::realign_job(reads, alignment, model))?;
    }

    info!(
        chain = !config.no_chain,
        realign = config.realigns(),
        em = config.em,
        variants = config.call_variants,
        "Planned pipeline"
    );
    Ok(())
}

/// Runs configured pipelines against one store and tool adapter
pub struct Pipeline {
    store: Arc<dyn ArtifactStore>,
    tools: Arc<dyn ToolAdapter>,
    work_root: PathBuf,
    runs_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ArtifactStore>, tools: Arc<dyn ToolAdapter>, work_root: PathBuf) -> Self {
        Self {
            store,
            tools,
            work_root,
            runs_dir: None,
        }
    }

    /// Append each run's events under `runs_dir`
    pub fn with_run_log(mut self, runs_dir: PathBuf) -> Self {
        self.runs_dir = Some(runs_dir);
        self
    }

    /// Import the config's inputs
    pub async fn import_inputs(&self, config: &PipelineConfig) -> Result<PipelineInputs> {
        let reference = self
            .store
            .import(&config.reference)
            .await
            .with_context(|| format!("Failed to import reference {}", config.reference))?;
        let reads = self
            .store
            .import(&config.sample)
            .await
            .with_context(|| format!("Failed to import sample {}", config.sample))?;
        let model = match &config.hmm_file {
            Some(location) => Some(
                self.store
                    .import(location)
                    .await
                    .with_context(|| format!("Failed to import model {}", location))?,
            ),
            None => None,
        };

        Ok(PipelineInputs {
            reference,
            reads,
            model,
        })
    }

    /// Validate `config`, import its inputs and run every enabled stage
    pub async fn run(&self, config: PipelineConfig) -> Result<RunReport> {
        self.run_with(config, |_| {}).await
    }

    /// Like [`Pipeline::run`], handing the run's cancel handle to `on_start`
    #[instrument(skip(self, config, on_start), fields(reference = %config.reference))]
    pub async fn run_with<F>(&self, config: PipelineConfig, on_start: F) -> Result<RunReport>
    where
        F: FnOnce(CancelHandle),
    {
        config.validate().context("Invalid pipeline config")?;
        let inputs = self.import_inputs(&config).await?;

        let options = SchedulerOptions::from_config(&config, self.runs_dir.clone());
        let services = Arc::new(Services {
            store: Arc::clone(&self.store),
            tools: Arc::clone(&self.tools),
            config: Arc::new(config),
            work_root: self.work_root.clone(),
        });

        let scheduler = Scheduler::new(services, options);
        info!(run_id = %scheduler.run_id(), "Running pipeline");
        on_start(scheduler.canceller());

        let output = scheduler.run(root_job(inputs)).await?;
        Ok(output.report)
    }
}

