//! Pipeline Integration Tests
//!
//! Runs whole pipelines against a scripted tool adapter that imitates bwa
//! and margin closely enough for the stages to chain together.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use marginflow::adapters::{ToolAdapter, ToolError, ToolRef, DATA_MOUNT};
use marginflow::config::ModelType;
use marginflow::core::FsArtifactStore;
use marginflow::domain::{ErrorKind, IndexSuffix, Location, NodeStatus};
use marginflow::pipeline::sam::SamFile;
use marginflow::{ConfigError, Pipeline, PipelineConfig, RunReport};
use tempfile::TempDir;

const READS: &str = "\
@read0\nACGTACGTAC\n+\n!!!!!!!!!!\n\
@read1\nGGGTTTAAACCC\n+\n!!!!!!!!!!!!\n\
@read2\nTTAGGC\n+\n!!!!!!\n\
@read3\nCCCCAAAAGGGGTTTT\n+\n!!!!!!!!!!!!!!!!\n";

/// Imitates `bwa` and `margin` inside the working directory
#[derive(Default)]
struct ScriptedTools {
    calls: Mutex<Vec<String>>,

    /// "tool command" that exits non-zero
    fail: Option<&'static str>,
}

impl ScriptedTools {
    fn failing(command: &'static str) -> Self {
        Self {
            fail: Some(command),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn local(work_dir: &Path, mount: &str) -> PathBuf {
    work_dir.join(mount.strip_prefix(DATA_MOUNT).unwrap_or(mount))
}

fn flag<'a>(params: &'a [String], name: &str) -> Option<&'a str> {
    let at = params.iter().position(|p| p == name)?;
    params.get(at + 1).map(String::as_str)
}

fn io<T>(path: &Path, result: std::io::Result<T>) -> Result<T, ToolError> {
    result.map_err(|source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn failed(tool: &ToolRef, stderr: impl Into<String>) -> ToolError {
    ToolError::Failed {
        tool: tool.name.clone(),
        code: 1,
        stderr: stderr.into(),
    }
}

/// One SAM record per FASTQ read, in input order
fn align_reads(fastq: &str) -> String {
    let mut sam = String::from("@HD\tVN:1.5\n@SQ\tSN:chr1\tLN:1000\n");
    let lines: Vec<&str> = fastq.lines().collect();
    for read in lines.chunks(4) {
        let name = read[0].trim_start_matches('@');
        let seq = read[1];
        sam.push_str(&format!(
            "{}\t0\tchr1\t1\t60\t{}M\t*\t0\t0\t{}\t*\n",
            name,
            seq.len(),
            seq
        ));
    }
    sam
}

#[async_trait]
impl ToolAdapter for ScriptedTools {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        tool: &ToolRef,
        params: &[String],
        work_dir: &Path,
        stdout: Option<&Path>,
    ) -> Result<(), ToolError> {
        let command = params.first().map(String::as_str).unwrap_or_default();
        let call = format!("{} {}", tool.name, command);
        self.calls.lock().unwrap().push(call.clone());
        if self.fail == Some(call.as_str()) {
            return Err(failed(tool, "scripted failure"));
        }

        let output = flag(params, "--output").map(|m| local(work_dir, m));
        let input = |name: &str| -> Result<String, ToolError> {
            let mount = flag(params, name).ok_or_else(|| failed(tool, format!("missing {}", name)))?;
            let path = local(work_dir, mount);
            io(&path, std::fs::read_to_string(&path))
        };
        let write = |content: String| -> Result<(), ToolError> {
            let path = output.clone().ok_or_else(|| failed(tool, "missing --output"))?;
            io(&path, std::fs::write(&path, content))
        };

        match call.as_str() {
            "bwa index" => {
                let reference = local(work_dir, &params[1]);
                for suffix in IndexSuffix::ALL {
                    let path = PathBuf::from(format!("{}{}", reference.display(), suffix));
                    io(&path, std::fs::write(&path, format!("index{}\n", suffix)))?;
                }
                Ok(())
            }
            "bwa mem" => {
                let reference = local(work_dir, &params[1]);
                for suffix in IndexSuffix::ALL {
                    let path = PathBuf::from(format!("{}{}", reference.display(), suffix));
                    if !path.exists() {
                        return Err(failed(tool, format!("index file {} not staged", path.display())));
                    }
                }
                let reads = local(work_dir, &params[2]);
                let fastq = io(&reads, std::fs::read_to_string(&reads))?;
                let out = stdout.ok_or_else(|| failed(tool, "stdout not captured"))?;
                io(out, std::fs::write(out, align_reads(&fastq)))
            }
            "margin chain" => write(input("--alignment")?),
            "margin realign" => {
                input("--model")?;
                write(input("--alignment")?)
            }
            "margin init-model" => write(format!("hmm {}\n", flag(params, "--model-type").unwrap_or("?"))),
            "margin expectations" => {
                input("--model")?;
                write(format!("expectations {}\n", input("--alignment")?.lines().count()))
            }
            "margin maximize" => {
                let model = input("--model")?;
                write(format!("{}trained\n", model))
            }
            "margin aligned-pairs" => {
                let records = input("--alignment")?
                    .lines()
                    .filter(|l| !l.starts_with('@'))
                    .count();
                write(format!("pairs {}\n", records))
            }
            "margin call-variants" => write(format!("##fileformat=VCFv4.2\n{}", input("--posteriors")?)),
            _ => Err(failed(tool, format!("unexpected call: {:?}", params))),
        }
    }
}

struct Fixture {
    temp: TempDir,
    tools: Arc<ScriptedTools>,
}

impl Fixture {
    fn new(tools: ScriptedTools) -> Self {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("ref.fa"), ">chr1\nACGTACGTACGTACGT\n").unwrap();
        std::fs::write(temp.path().join("reads.fq"), READS).unwrap();
        std::fs::write(temp.path().join("input.hmm"), "hmm fiveState\n").unwrap();
        Self {
            temp,
            tools: Arc::new(tools),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(
            Location::file(self.path("ref.fa")),
            Location::file(self.path("reads.fq")),
            Location::file(self.path("out/aligned.sam")),
        );
        config.max_length_per_job = 20;
        config
    }

    fn with_model(&self, mut config: PipelineConfig) -> PipelineConfig {
        config.hmm_file = Some(Location::file(self.path("input.hmm")));
        config
    }

    async fn run(&self, config: PipelineConfig) -> anyhow::Result<RunReport> {
        let store = FsArtifactStore::open(self.path("store")).await.unwrap();
        let tools: Arc<dyn ToolAdapter> = self.tools.clone();
        Pipeline::new(Arc::new(store), tools, self.path("work"))
            .with_run_log(self.path("runs"))
            .run(config)
            .await
    }

    fn output_sam(&self) -> SamFile {
        let text = std::fs::read_to_string(self.path("out/aligned.sam")).unwrap();
        SamFile::parse(&text).unwrap()
    }
}

fn read_names(sam: &SamFile) -> Vec<&str> {
    sam.records
        .iter()
        .map(|r| r.split('\t').next().unwrap())
        .collect()
}

fn position(report: &RunReport, name: &str) -> usize {
    report
        .executed()
        .iter()
        .position(|n| *n == name)
        .unwrap_or_else(|| panic!("{} did not run", name))
}

#[tokio::test]
async fn test_align_only() {
    let fixture = Fixture::new(ScriptedTools::default());
    let mut config = fixture.config();
    config.no_chain = true;
    config.no_realign = true;

    let report = fixture.run(config).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.failures);
    assert_eq!(
        report.executed(),
        vec!["marginflow", "bwa-index", "bwa-align", "export-alignment"]
    );
    assert_eq!(fixture.tools.calls(), vec!["bwa index", "bwa mem"]);

    let sam = fixture.output_sam();
    assert_eq!(sam.header.len(), 2);
    assert_eq!(read_names(&sam), vec!["read0", "read1", "read2", "read3"]);
}

#[tokio::test]
async fn test_chain_and_sharded_realignment() {
    let fixture = Fixture::new(ScriptedTools::default());
    let config = fixture.with_model(fixture.config());

    let report = fixture.run(config).await.unwrap();
    assert!(report.succeeded(), "{:?}", report.failures);

    let shards: Vec<&str> = report
        .executed()
        .into_iter()
        .filter(|n| n.starts_with("realign-shard-"))
        .collect();
    assert!(shards.len() > 1, "expected several shards, got {:?}", shards);

    let merge = position(&report, "realign-merge");
    for shard in &shards {
        assert!(position(&report, shard) < merge);
    }
    assert!(position(&report, "chain") < position(&report, "realign"));
    assert!(merge < position(&report, "export-alignment"));

    // Merged in partition order with one header
    let sam = fixture.output_sam();
    assert_eq!(sam.header.len(), 2);
    assert_eq!(read_names(&sam), vec!["read0", "read1", "read2", "read3"]);
}

#[tokio::test]
async fn test_em_trains_then_realigns_with_trained_model() {
    let fixture = Fixture::new(ScriptedTools::default());
    let mut config = fixture.config();
    config.em = true;
    config.em_iterations = 2;
    config.model_type = Some(ModelType::ThreeState);
    config.output_model = Some(Location::file(fixture.path("out/trained.hmm")));

    let report = fixture.run(config).await.unwrap();
    assert!(report.succeeded(), "{:?}", report.failures);

    for name in [
        "em",
        "em-init-model",
        "em-iteration-0",
        "em-maximize-0",
        "em-iteration-1",
        "em-maximize-1",
        "export-model",
        "realign",
        "realign-merge",
        "export-alignment",
    ] {
        assert_eq!(
            report.find(name).map(|n| n.status),
            Some(NodeStatus::Completed),
            "{}",
            name
        );
    }
    assert!(report.find("em-iteration-2").is_none());
    assert!(position(&report, "em-init-model") < position(&report, "em-iteration-0"));
    assert!(position(&report, "em-maximize-0") < position(&report, "em-iteration-1"));
    assert!(position(&report, "export-model") < position(&report, "realign"));

    let model = std::fs::read_to_string(fixture.path("out/trained.hmm")).unwrap();
    assert_eq!(model, "hmm threeState\ntrained\ntrained\n");
    assert_eq!(fixture.output_sam().records.len(), 4);

    let calls = fixture.tools.calls();
    assert_eq!(calls.iter().filter(|c| *c == "margin maximize").count(), 2);
}

#[tokio::test]
async fn test_variant_calling_exports_vcf() {
    let fixture = Fixture::new(ScriptedTools::default());
    let mut config = fixture.with_model(fixture.config());
    config.no_chain = true;
    config.call_variants = true;
    config.output_vcf_path = Some(Location::file(fixture.path("out/calls.vcf")));

    let report = fixture.run(config).await.unwrap();
    assert!(report.succeeded(), "{:?}", report.failures);
    assert!(report.find("chain").is_none());

    let pairs = report
        .executed()
        .into_iter()
        .filter(|n| n.starts_with("variants-pairs-"))
        .count();
    assert!(pairs > 1);

    let vcf = std::fs::read_to_string(fixture.path("out/calls.vcf")).unwrap();
    assert!(vcf.starts_with("##fileformat=VCFv4.2\n"));
    // One posterior block per shard, concatenated in order
    let total: usize = vcf
        .lines()
        .filter_map(|l| l.strip_prefix("pairs "))
        .map(|n| n.parse::<usize>().unwrap())
        .sum();
    assert_eq!(vcf.lines().filter(|l| l.starts_with("pairs ")).count(), pairs);
    assert_eq!(total, 4);
}

#[tokio::test]
async fn test_missing_model_fails_before_running() {
    let fixture = Fixture::new(ScriptedTools::default());

    let err = fixture.run(fixture.config()).await.unwrap_err();

    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<ConfigError>(), Some(ConfigError::MissingModel { .. }))));
    assert!(fixture.tools.calls().is_empty());
}

#[tokio::test]
async fn test_tool_failure_stops_dependents() {
    let fixture = Fixture::new(ScriptedTools::failing("margin realign"));
    let config = fixture.with_model(fixture.config());

    let report = fixture.run(config).await.unwrap();

    assert!(!report.succeeded());
    assert!(report
        .failures
        .iter()
        .all(|f| f.kind == ErrorKind::ToolFailed && f.name.starts_with("realign-shard-")));
    assert_eq!(report.find("realign-merge").unwrap().status, NodeStatus::Failed);
    assert_eq!(report.find("export-alignment").unwrap().status, NodeStatus::Failed);
    assert!(!report.executed().contains(&"export-alignment"));
    assert!(!fixture.path("out/aligned.sam").exists());

    // Failing shards still name what they had staged
    assert!(report.failures.iter().all(|f| f.inputs.len() == 4));
}

#[tokio::test]
async fn test_workspaces_are_removed_after_run() {
    let fixture = Fixture::new(ScriptedTools::default());
    let config = fixture.with_model(fixture.config());

    let report = fixture.run(config).await.unwrap();
    assert!(report.succeeded());

    let run_work = fixture.path("work").join(report.run_id.to_string());
    let leftover = std::fs::read_dir(&run_work)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}
