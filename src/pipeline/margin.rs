//! Margin stages: chaining, sharded HMM realignment, EM training and
//! variant calling.
//!
//! Every stage here runs the `margin` tool with a subcommand as its first
//! parameter. The sharded stages share one shape: a hub node splits the
//! alignment and adds a child per shard, then a follow-on consumes the
//! shard promises in partition order.
//!
//! EM iterations are chained: each maximize node adds the next iteration
//! as its own follow-on, and the last one continues the pipeline with
//! realignment under the trained model.

use anyhow::{Context, Result};
use tracing::info;

use crate::adapters::ToolRef;
use crate::core::{fan_out, Input, Job, NodeContext, Promise, Ready};
use crate::domain::{ArtifactId, ResourceHint};

use super::stage::{concatenate, merge_alignments, split_alignment, ToolCall};
use super::{export_job, EXPORT_ALIGNMENT_NODE};

pub const CHAIN_NODE: &str = "chain";
pub const REALIGN_NODE: &str = "realign";
pub const MERGE_NODE: &str = "realign-merge";
pub const EM_NODE: &str = "em";
pub const INIT_MODEL_NODE: &str = "em-init-model";
pub const EXPORT_MODEL_NODE: &str = "export-model";
pub const VARIANTS_NODE: &str = "variants";
pub const CALL_VARIANTS_NODE: &str = "call-variants";
pub const EXPORT_VARIANTS_NODE: &str = "export-variants";

/// Memory per input byte for HMM work
const HMM_MEMORY_FACTOR: u64 = 6;

/// Reference and reads, which every margin stage stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSet {
    pub reference: ArtifactId,
    pub reads: ArtifactId,
}

/// What the EM iterations carry from one to the next
#[derive(Debug, Clone)]
struct Training {
    reads: ReadSet,

    /// Full alignment to realign once training is done
    alignment: ArtifactId,

    /// Sampled training shards, in order
    shards: Vec<ArtifactId>,
}

fn margin(ctx: &NodeContext) -> ToolRef {
    ToolRef::new("margin", ctx.config().tools.margin.clone())
}

async fn shard_hints(
    ctx: &NodeContext,
    shards: &[ArtifactId],
    reads: ReadSet,
) -> Result<Vec<ResourceHint>> {
    let mut hints = Vec::with_capacity(shards.len());
    for &shard in shards {
        hints.push(
            ctx.resources_for(&[shard, reads.reference], HMM_MEMORY_FACTOR)
                .await?,
        );
    }
    Ok(hints)
}

// Chaining

/// Chain the raw alignment
pub fn chain_job(reads: ReadSet, alignment: Promise<ArtifactId>) -> Job<ArtifactId> {
    Job::new(CHAIN_NODE, (Ready(reads), alignment), |ctx, (reads, alignment)| {
        chain(ctx, reads, alignment)
    })
}

async fn chain(ctx: NodeContext, reads: ReadSet, alignment: ArtifactId) -> Result<ArtifactId> {
    let ids = ToolCall::new(margin(&ctx))
        .inputs([reads.reference, reads.reads, alignment])
        .output(".sam")
        .run(&ctx, |m| {
            Ok(vec![
                "chain".to_string(),
                "--reference".to_string(),
                m.input(reads.reference)?,
                "--reads".to_string(),
                m.input(reads.reads)?,
                "--alignment".to_string(),
                m.input(alignment)?,
                "--output".to_string(),
                m.output(0)?,
            ])
        })
        .await?;

    let chained = single(ids, "chain")?;
    info!(%chained, "Chained alignment");
    Ok(chained)
}

// Realignment

/// Shard, realign and merge `alignment` under `model`, then export it
pub fn realign_job<I>(reads: ReadSet, alignment: I, model: ArtifactId) -> Job<()>
where
    I: Input<Value = ArtifactId>,
{
    Job::new(REALIGN_NODE, (Ready((reads, model)), alignment), |ctx, ((reads, model), alignment)| {
        realign(ctx, reads, alignment, model)
    })
}

async fn realign(
    ctx: NodeContext,
    reads: ReadSet,
    alignment: ArtifactId,
    model: ArtifactId,
) -> Result<()> {
    let config = ctx.config().clone();
    let shards = split_alignment(&ctx, alignment, config.max_length_per_job, None).await?;
    let hints = shard_hints(&ctx, &shards, reads).await?;

    let parts = fan_out(&ctx, shards.into_iter().zip(hints), |index, (shard, hint)| {
        Job::new(format!("realign-shard-{}", index), Ready(shard), move |ctx, shard| {
            realign_shard(ctx, reads, shard, model)
        })
        .with_resources(hint)
    })?;
    info!(shards = parts.len(), "Realigning shards");

    let merged = ctx.add_follow_on(Job::new(MERGE_NODE, parts, |ctx, parts: Vec<ArtifactId>| async move {
        merge_alignments(&ctx, &parts).await
    }))?;

    ctx.add_follow_on(export_job(
        EXPORT_ALIGNMENT_NODE,
        merged.promise(),
        config.output_sam_path.clone(),
    ))?;

    if config.call_variants {
        ctx.add_follow_on(variants_job(reads, merged.promise(), model))?;
    }
    Ok(())
}

async fn realign_shard(
    ctx: NodeContext,
    reads: ReadSet,
    shard: ArtifactId,
    model: ArtifactId,
) -> Result<ArtifactId> {
    let gap_gamma = ctx.config().gap_gamma;
    let match_gamma = ctx.config().match_gamma;

    let ids = ToolCall::new(margin(&ctx))
        .inputs([reads.reference, reads.reads, shard, model])
        .output(".sam")
        .run(&ctx, |m| {
            Ok(vec![
                "realign".to_string(),
                "--reference".to_string(),
                m.input(reads.reference)?,
                "--reads".to_string(),
                m.input(reads.reads)?,
                "--alignment".to_string(),
                m.input(shard)?,
                "--model".to_string(),
                m.input(model)?,
                "--gap-gamma".to_string(),
                gap_gamma.to_string(),
                "--match-gamma".to_string(),
                match_gamma.to_string(),
                "--output".to_string(),
                m.output(0)?,
            ])
        })
        .await?;

    single(ids, "realign")
}

// EM training

/// Train a model on a sample of `alignment`, export it, then realign with it
pub fn em_job<I>(reads: ReadSet, alignment: I, model: Option<ArtifactId>) -> Job<()>
where
    I: Input<Value = ArtifactId>,
{
    Job::new(EM_NODE, (Ready((reads, model)), alignment), |ctx, ((reads, model), alignment)| {
        train(ctx, reads, alignment, model)
    })
}

async fn train(
    ctx: NodeContext,
    reads: ReadSet,
    alignment: ArtifactId,
    model: Option<ArtifactId>,
) -> Result<()> {
    let config = ctx.config().clone();
    let shards = split_alignment(
        &ctx,
        alignment,
        config.max_length_per_job,
        Some(config.max_sample_alignment_length),
    )
    .await?;
    info!(
        shards = shards.len(),
        iterations = config.em_iterations,
        "Training model"
    );

    let training = Training {
        reads,
        alignment,
        shards,
    };

    match model {
        Some(model) => {
            ctx.add_follow_on(iteration_job(0, training, Ready(model)))?;
        }
        None => {
            let init = ctx.add_child(Job::new(INIT_MODEL_NODE, (), |ctx, ()| init_model(ctx)))?;
            ctx.add_follow_on(iteration_job(0, training, init.promise()))?;
        }
    }
    Ok(())
}

async fn init_model(ctx: NodeContext) -> Result<ArtifactId> {
    let config = ctx.config().clone();
    let model_type = config
        .model_type
        .context("No model_type to build a starting model from")?;

    let ids = ToolCall::new(margin(&ctx))
        .output(".hmm")
        .run(&ctx, |m| {
            let mut params = vec![
                "init-model".to_string(),
                "--model-type".to_string(),
                model_type.to_string(),
                "--gc-content".to_string(),
                config.gc_content.to_string(),
            ];
            if config.random_start {
                params.push("--random-start".to_string());
            }
            params.extend(["--output".to_string(), m.output(0)?]);
            Ok(params)
        })
        .await?;

    single(ids, "init-model")
}

fn iteration_job<I>(iteration: u32, training: Training, model: I) -> Job<()>
where
    I: Input<Value = ArtifactId>,
{
    Job::new(
        format!("em-iteration-{}", iteration),
        (Ready(training), model),
        move |ctx, (training, model)| expectation_round(ctx, iteration, training, model),
    )
}

async fn expectation_round(
    ctx: NodeContext,
    iteration: u32,
    training: Training,
    model: ArtifactId,
) -> Result<()> {
    let reads = training.reads;
    let hints = shard_hints(&ctx, &training.shards, reads).await?;

    let expectations = fan_out(
        &ctx,
        training.shards.iter().copied().zip(hints),
        |index, (shard, hint)| {
            Job::new(
                format!("em-expectations-{}-{}", iteration, index),
                Ready(shard),
                move |ctx, shard| expectations(ctx, reads, shard, model),
            )
            .with_resources(hint)
        },
    )?;

    ctx.add_follow_on(Job::new(
        format!("em-maximize-{}", iteration),
        (Ready((training, model)), expectations),
        move |ctx, ((training, model), expectations)| {
            maximize(ctx, iteration, training, model, expectations)
        },
    ))?;
    Ok(())
}

async fn expectations(
    ctx: NodeContext,
    reads: ReadSet,
    shard: ArtifactId,
    model: ArtifactId,
) -> Result<ArtifactId> {
    let config = ctx.config().clone();

    let ids = ToolCall::new(margin(&ctx))
        .inputs([reads.reference, reads.reads, shard, model])
        .output(".expectations")
        .run(&ctx, |m| {
            let mut params = vec![
                "expectations".to_string(),
                "--reference".to_string(),
                m.input(reads.reference)?,
                "--reads".to_string(),
                m.input(reads.reads)?,
                "--alignment".to_string(),
                m.input(shard)?,
                "--model".to_string(),
                m.input(model)?,
                "--gap-gamma".to_string(),
                config.gap_gamma.to_string(),
            ];
            if config.update_band {
                params.push("--update-band".to_string());
            }
            params.extend(["--output".to_string(), m.output(0)?]);
            Ok(params)
        })
        .await?;

    single(ids, "expectations")
}

async fn maximize(
    ctx: NodeContext,
    iteration: u32,
    training: Training,
    model: ArtifactId,
    expectations: Vec<ArtifactId>,
) -> Result<ArtifactId> {
    let config = ctx.config().clone();

    let ids = ToolCall::new(margin(&ctx))
        .input(model)
        .inputs(expectations.iter().copied())
        .output(".hmm")
        .run(&ctx, |m| {
            let mut params = vec![
                "maximize".to_string(),
                "--model".to_string(),
                m.input(model)?,
            ];
            if !config.train_emissions {
                params.push("--no-emissions".to_string());
            }
            params.extend(["--output".to_string(), m.output(0)?]);
            params.push("--expectations".to_string());
            for &e in &expectations {
                params.push(m.input(e)?);
            }
            Ok(params)
        })
        .await?;
    let trained = single(ids, "maximize")?;
    info!(iteration, model = %trained, "Maximization step done");

    let next = iteration + 1;
    if next < config.em_iterations {
        ctx.add_follow_on(iteration_job(next, training, Ready(trained)))?;
        return Ok(trained);
    }

    let destination = config
        .output_model
        .clone()
        .context("EM finished but output_model is not set")?;
    ctx.add_follow_on(export_job(EXPORT_MODEL_NODE, Ready(trained), destination))?;
    ctx.add_follow_on(realign_job(training.reads, Ready(training.alignment), trained))?;
    Ok(trained)
}

// Variant calling

/// Compute aligned-pair posteriors per shard, then call variants over all
/// of them in shard order
pub fn variants_job<I>(reads: ReadSet, alignment: I, model: ArtifactId) -> Job<()>
where
    I: Input<Value = ArtifactId>,
{
    Job::new(VARIANTS_NODE, (Ready((reads, model)), alignment), |ctx, ((reads, model), alignment)| {
        call_variants(ctx, reads, alignment, model)
    })
}

async fn call_variants(
    ctx: NodeContext,
    reads: ReadSet,
    alignment: ArtifactId,
    model: ArtifactId,
) -> Result<()> {
    let config = ctx.config().clone();
    let destination = config
        .output_vcf_path
        .clone()
        .context("Variant calling is enabled but output_vcf_path is not set")?;

    let shards = split_alignment(&ctx, alignment, config.max_length_per_job, None).await?;
    let hints = shard_hints(&ctx, &shards, reads).await?;

    let posteriors = fan_out(&ctx, shards.into_iter().zip(hints), |index, (shard, hint)| {
        Job::new(format!("variants-pairs-{}", index), Ready(shard), move |ctx, shard| {
            aligned_pairs(ctx, reads, shard, model)
        })
        .with_resources(hint)
    })?;

    let vcf = ctx.add_follow_on(Job::new(
        CALL_VARIANTS_NODE,
        (Ready(reads), posteriors),
        |ctx, (reads, posteriors)| call(ctx, reads, posteriors),
    ))?;
    ctx.add_follow_on(export_job(EXPORT_VARIANTS_NODE, vcf.promise(), destination))?;
    Ok(())
}

async fn aligned_pairs(
    ctx: NodeContext,
    reads: ReadSet,
    shard: ArtifactId,
    model: ArtifactId,
) -> Result<ArtifactId> {
    let ids = ToolCall::new(margin(&ctx))
        .inputs([reads.reference, reads.reads, shard, model])
        .output(".pairs")
        .run(&ctx, |m| {
            Ok(vec![
                "aligned-pairs".to_string(),
                "--reference".to_string(),
                m.input(reads.reference)?,
                "--reads".to_string(),
                m.input(reads.reads)?,
                "--alignment".to_string(),
                m.input(shard)?,
                "--model".to_string(),
                m.input(model)?,
                "--output".to_string(),
                m.output(0)?,
            ])
        })
        .await?;

    single(ids, "aligned-pairs")
}

async fn call(ctx: NodeContext, reads: ReadSet, posteriors: Vec<ArtifactId>) -> Result<ArtifactId> {
    let threshold = ctx.config().variant_threshold;
    let combined = concatenate(&ctx, &posteriors, ".pairs").await?;

    let ids = ToolCall::new(margin(&ctx))
        .inputs([reads.reference, combined])
        .output(".vcf")
        .run(&ctx, |m| {
            Ok(vec![
                "call-variants".to_string(),
                "--reference".to_string(),
                m.input(reads.reference)?,
                "--posteriors".to_string(),
                m.input(combined)?,
                "--threshold".to_string(),
                threshold.to_string(),
                "--output".to_string(),
                m.output(0)?,
            ])
        })
        .await?;

    let vcf = single(ids, "call-variants")?;
    info!(%vcf, shards = posteriors.len(), "Called variants");
    Ok(vcf)
}

fn single(ids: Vec<ArtifactId>, command: &str) -> Result<ArtifactId> {
    ids.into_iter()
        .next()
        .with_context(|| format!("margin {} produced no output", command))
}
