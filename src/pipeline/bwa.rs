//! BWA stages: index build and read alignment.
//!
//! `bwa index` writes its five index files next to the reference, and
//! `bwa mem` expects to find them there, so both stages stage the reference
//! under a `ref<token>.fa` name and the index members under that name plus
//! their suffix.

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use crate::adapters::ToolRef;
use crate::core::{Job, NodeContext, Promise, Ready};
use crate::domain::{ArtifactFamily, ArtifactId, IndexSuffix, ResourceHint};

use super::stage::ToolCall;

pub const INDEX_NODE: &str = "bwa-index";
pub const ALIGN_NODE: &str = "bwa-align";

fn bwa(ctx: &NodeContext) -> ToolRef {
    ToolRef::new("bwa", ctx.config().tools.bwa.clone())
}

fn reference_name() -> String {
    format!("ref{}.fa", Uuid::new_v4().simple())
}

/// Build the index family for `reference`
pub fn index_job(reference: ArtifactId, resources: ResourceHint) -> Job<ArtifactFamily> {
    Job::new(INDEX_NODE, Ready(reference), build_index).with_resources(resources)
}

/// Align `reads` against `reference` once its index exists
pub fn align_job(
    reference: ArtifactId,
    reads: ArtifactId,
    index: Promise<ArtifactFamily>,
    resources: ResourceHint,
) -> Job<ArtifactId> {
    Job::new(
        ALIGN_NODE,
        (Ready((reference, reads)), index),
        |ctx, ((reference, reads), index)| align(ctx, reference, reads, index),
    )
    .with_resources(resources)
}

async fn build_index(ctx: NodeContext, reference: ArtifactId) -> Result<ArtifactFamily> {
    let name = reference_name();

    let mut call = ToolCall::new(bwa(&ctx)).input_named(reference, name.clone());
    for suffix in IndexSuffix::ALL {
        call = call.output_named(format!("{}{}", name, suffix));
    }

    let ids = call
        .run(&ctx, |mounts| {
            Ok(vec!["index".to_string(), mounts.input(reference)?])
        })
        .await?;

    let family = ArtifactFamily::from_members(reference, IndexSuffix::ALL.into_iter().zip(ids))?;
    info!(reference = %reference, "Built BWA index");
    Ok(family)
}

async fn align(
    ctx: NodeContext,
    reference: ArtifactId,
    reads: ArtifactId,
    index: ArtifactFamily,
) -> Result<ArtifactId> {
    let name = reference_name();

    let mut call = ToolCall::new(bwa(&ctx))
        .input_named(reference, name.clone())
        .input(reads)
        .stdout(".sam");
    for (suffix, id) in index.iter() {
        call = call.input_named(id, format!("{}{}", name, suffix));
    }

    let ids = call
        .run(&ctx, |mounts| {
            Ok(vec![
                "mem".to_string(),
                mounts.input(reference)?,
                mounts.input(reads)?,
            ])
        })
        .await?;

    let alignment = ids
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("bwa mem produced no alignment"))?;
    info!(%alignment, "Aligned reads");
    Ok(alignment)
}
