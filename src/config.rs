//! Pipeline configuration.
//!
//! A run is described by one YAML file deserialized into [`PipelineConfig`].
//! Unknown keys are rejected at load time, and [`PipelineConfig::validate`]
//! catches option combinations that cannot run before any node starts.
//!
//! Engine state (artifact store, run logs, workspaces) lives under a home
//! directory resolved by [`paths::EnginePaths`].

pub mod paths;

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Location;

/// Default docker image for bwa
pub const DEFAULT_BWA_IMAGE: &str = "quay.io/ucsc_cgl/bwa";

/// Default docker image for the margin tools (chain, realign, EM, caller)
pub const DEFAULT_MARGIN_IMAGE: &str = "quay.io/ucsc_cgl/margin";

/// HMM topology to start EM from when no input model is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelType {
    FiveState,
    FiveStateAsymmetric,
    ThreeState,
    ThreeStateAsymmetric,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelType::FiveState => "fiveState",
            ModelType::FiveStateAsymmetric => "fiveStateAsymmetric",
            ModelType::ThreeState => "threeState",
            ModelType::ThreeStateAsymmetric => "threeStateAsymmetric",
        };
        f.write_str(s)
    }
}

/// Container image per tool family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolImages {
    #[serde(default = "default_bwa_image")]
    pub bwa: String,

    #[serde(default = "default_margin_image")]
    pub margin: String,
}

impl Default for ToolImages {
    fn default() -> Self {
        Self {
            bwa: default_bwa_image(),
            margin: default_margin_image(),
        }
    }
}

/// Everything one run needs to know, fixed before the first node starts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Reference FASTA
    #[serde(alias = "ref")]
    pub reference: Location,

    /// Reads FASTQ
    pub sample: Location,

    /// Input HMM model for realignment
    #[serde(default)]
    pub hmm_file: Option<Location>,

    /// Where the final alignment goes
    pub output_sam_path: Location,

    /// Where a trained model goes (required with EM)
    #[serde(default, alias = "out_model")]
    pub output_model: Option<Location>,

    /// Where variant calls go (required with call_variants)
    #[serde(default)]
    pub output_vcf_path: Option<Location>,

    #[serde(default)]
    pub no_chain: bool,

    #[serde(default)]
    pub no_realign: bool,

    /// Train the model with expectation maximisation before realigning
    #[serde(default, rename = "EM", alias = "em")]
    pub em: bool,

    #[serde(default)]
    pub call_variants: bool,

    #[serde(default = "default_gap_gamma")]
    pub gap_gamma: f64,

    #[serde(default)]
    pub match_gamma: f64,

    #[serde(default = "default_em_iterations")]
    pub em_iterations: u32,

    #[serde(default)]
    pub model_type: Option<ModelType>,

    #[serde(default)]
    pub random_start: bool,

    #[serde(default = "default_true")]
    pub train_emissions: bool,

    #[serde(default)]
    pub update_band: bool,

    #[serde(default = "default_gc_content")]
    pub gc_content: f64,

    /// Posterior cutoff for calling a variant
    #[serde(default = "default_variant_threshold")]
    pub variant_threshold: f64,

    /// Maximum read bases per shard
    #[serde(default = "default_max_length_per_job")]
    pub max_length_per_job: u64,

    /// Read bases sampled from the alignment for EM training
    #[serde(default = "default_max_sample_alignment_length")]
    pub max_sample_alignment_length: u64,

    #[serde(default)]
    pub tools: ToolImages,

    #[serde(default)]
    pub max_parallel_nodes: Option<usize>,

    #[serde(default)]
    pub node_timeout_seconds: Option<u64>,

    /// tracing filter directive ("info", "marginflow=debug", ...)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Engine home override (MARGINFLOW_HOME still wins)
    #[serde(default)]
    pub home: Option<std::path::PathBuf>,
}

fn default_bwa_image() -> String {
    DEFAULT_BWA_IMAGE.to_string()
}

fn default_margin_image() -> String {
    DEFAULT_MARGIN_IMAGE.to_string()
}

fn default_gap_gamma() -> f64 {
    0.5
}

fn default_em_iterations() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_gc_content() -> f64 {
    0.5
}

fn default_variant_threshold() -> f64 {
    0.3
}

fn default_max_length_per_job() -> u64 {
    700_000
}

fn default_max_sample_alignment_length() -> u64 {
    50_000
}

/// Option combinations that cannot run
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{stage} needs a model: set hmm_file or enable EM")]
    MissingModel { stage: &'static str },

    #[error("EM is enabled but output_model is not set")]
    MissingOutputModel,

    #[error("EM without hmm_file needs model_type to build a starting model")]
    MissingModelType,

    #[error("call_variants is enabled but output_vcf_path is not set")]
    MissingVcfOutput,

    #[error("EM trains the model used for realignment and cannot run with no_realign")]
    EmWithoutRealign,

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("{key} must be within [0, 1], got {value}")]
    OutOfRange { key: &'static str, value: f64 },
}

impl PipelineConfig {
    /// Minimal config: align `sample` to `reference` and export the SAM
    pub fn new(reference: Location, sample: Location, output_sam_path: Location) -> Self {
        Self {
            reference,
            sample,
            hmm_file: None,
            output_sam_path,
            output_model: None,
            output_vcf_path: None,
            no_chain: false,
            no_realign: false,
            em: false,
            call_variants: false,
            gap_gamma: default_gap_gamma(),
            match_gamma: 0.0,
            em_iterations: default_em_iterations(),
            model_type: None,
            random_start: false,
            train_emissions: true,
            update_band: false,
            gc_content: default_gc_content(),
            variant_threshold: default_variant_threshold(),
            max_length_per_job: default_max_length_per_job(),
            max_sample_alignment_length: default_max_sample_alignment_length(),
            tools: ToolImages::default(),
            max_parallel_nodes: None,
            node_timeout_seconds: None,
            log_level: None,
            home: None,
        }
    }

    /// Load from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid pipeline config")
    }

    /// Whether the HMM realignment stage runs
    pub fn realigns(&self) -> bool {
        !self.no_realign
    }

    /// Reject combinations that would fail part way through a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.realigns() && self.hmm_file.is_none() && !self.em {
            return Err(ConfigError::MissingModel {
                stage: "HMM realignment",
            });
        }
        if self.call_variants && self.hmm_file.is_none() && !self.em {
            return Err(ConfigError::MissingModel {
                stage: "Variant calling",
            });
        }

        if self.em {
            if self.no_realign {
                return Err(ConfigError::EmWithoutRealign);
            }
            if self.output_model.is_none() {
                return Err(ConfigError::MissingOutputModel);
            }
            if self.hmm_file.is_none() && self.model_type.is_none() {
                return Err(ConfigError::MissingModelType);
            }
            if self.em_iterations == 0 {
                return Err(ConfigError::Zero {
                    key: "em_iterations",
                });
            }
            if self.max_sample_alignment_length == 0 {
                return Err(ConfigError::Zero {
                    key: "max_sample_alignment_length",
                });
            }
        }

        if self.call_variants && self.output_vcf_path.is_none() {
            return Err(ConfigError::MissingVcfOutput);
        }

        if self.max_length_per_job == 0 {
            return Err(ConfigError::Zero {
                key: "max_length_per_job",
            });
        }

        for (key, value) in [
            ("gap_gamma", self.gap_gamma),
            ("match_gamma", self.match_gamma),
            ("gc_content", self.gc_content),
            ("variant_threshold", self.variant_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { key, value });
            }
        }

        Ok(())
    }

    /// Commented starter config for `marginflow generate`
    pub fn template() -> String {
        format!(
            r#"# marginflow pipeline configuration
# Locations are file:///absolute/paths or plain paths.
# Some options are filled in with defaults.

## Inputs ##
# Required: reference FASTA
reference: file:///path/to/reference.fa

# Required: reads FASTQ
sample: file:///path/to/reads.fq

# Required: where the final alignment is written
output_sam_path: file:///path/to/output.sam

# Optional: input HMM model (required for realignment unless EM is on)
hmm_file:

## Alignment options ##
no_chain: false
no_realign: false
gap_gamma: {gap_gamma}
match_gamma: 0.0
max_length_per_job: {max_length_per_job}

## EM options ##
EM: false
em_iterations: {em_iterations}
# Required when EM is on and hmm_file is empty: fiveState, fiveStateAsymmetric, threeState, threeStateAsymmetric
model_type:
# Required when EM is on
output_model:
max_sample_alignment_length: {max_sample_alignment_length}
random_start: false
train_emissions: true
update_band: false
gc_content: {gc_content}

## Variant calling ##
call_variants: false
output_vcf_path:
variant_threshold: {variant_threshold}

## Execution ##
tools:
  bwa: {bwa}
  margin: {margin}
# max_parallel_nodes: 8
# node_timeout_seconds: 3600
log_level: info
"#,
            gap_gamma = default_gap_gamma(),
            max_length_per_job = default_max_length_per_job(),
            em_iterations = default_em_iterations(),
            max_sample_alignment_length = default_max_sample_alignment_length(),
            gc_content = default_gc_content(),
            variant_threshold = default_variant_threshold(),
            bwa = DEFAULT_BWA_IMAGE,
            margin = DEFAULT_MARGIN_IMAGE,
        )
    }
}
