use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use equiv_core::generator::{OpenAiGenerator, StubGenerator, TextGenerator};
use equiv_core::model::{GoldenSnapshot, RunConfig};
use equiv_core::pipeline::{self, run_characterization};
use equiv_core::report::{self, ReportBuilder};
use equiv_core::strategy::StrategyRegistry;
use equiv_core::{GoldenCaptureRunner, GoldenComparator};

use crate::args::{CaptureArgs, CheckBuildArgs, Cli, Command, CompareArgs, RunArgs};
use crate::exit_codes;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let registry = StrategyRegistry::builtin();
    match cli.cmd {
        Command::Run(args) => run(args, &registry).await,
        Command::Capture(args) => capture(args, &registry).await,
        Command::Compare(args) => compare(args, &registry).await,
        Command::CheckBuild(args) => check_build(args, &registry).await,
    }
}

/// Map a failed dispatch to the exit-code contract.
pub fn classify_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<equiv_core::EngineError>() {
        Some(equiv_core::EngineError::Config(_) | equiv_core::EngineError::UnknownEcosystem(_)) => {
            exit_codes::CONFIG_ERROR
        }
        _ => exit_codes::INFRA_ERROR,
    }
}

fn artifacts_root(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(pipeline::default_artifacts_root)
}

/// The collaborator adapter, when the config asks for one. `None` means
/// stub/template mode throughout the pipeline.
fn build_generator(cfg: &RunConfig) -> anyhow::Result<Option<Arc<dyn TextGenerator>>> {
    match cfg.generator.kind.as_deref() {
        None | Some("stub") => Ok(None),
        Some("openai") => {
            let model = cfg
                .generator
                .model
                .clone()
                .ok_or_else(|| equiv_core::EngineError::Config("generator.model is required for kind: openai".into()))?;
            let mut generator = OpenAiGenerator::from_env(model)
                .map_err(|e| equiv_core::EngineError::Config(e.to_string()))?;
            if let Some(base_url) = cfg.generator.base_url.clone() {
                generator.base_url = base_url;
            }
            Ok(Some(Arc::new(generator)))
        }
        Some(other) => Err(equiv_core::EngineError::Config(format!(
            "unknown generator kind: {other}"
        ))
        .into()),
    }
}

fn report_exit_code(report: &equiv_core::OverallTestReport) -> i32 {
    let any_bad = report.failed > 0
        || report.errored > 0
        || report.build_success == Some(false)
        || report.unit_test_results.iter().any(|r| r.failed > 0 || r.errored > 0);
    if any_bad {
        exit_codes::TEST_FAILURE
    } else {
        exit_codes::OK
    }
}

async fn run(args: RunArgs, registry: &StrategyRegistry) -> anyhow::Result<i32> {
    let mut cfg = RunConfig::from_yaml_file(&args.config)?;
    if args.refactored.is_some() {
        cfg.refactored_repo_dir = args.refactored;
    }
    tracing::info!(
        config = %args.config.display(),
        ecosystem = %cfg.ecosystem,
        "loaded run configuration"
    );
    let generator = build_generator(&cfg)?;
    let report =
        run_characterization(&cfg, registry, generator, &artifacts_root(args.artifacts)).await?;
    report::print_summary(&report);
    Ok(report_exit_code(&report))
}

async fn capture(args: CaptureArgs, registry: &StrategyRegistry) -> anyhow::Result<i32> {
    let cfg = RunConfig::from_yaml_file(&args.config)?;
    let strategy = registry.resolve(&cfg.ecosystem)?;
    let generator: Arc<dyn TextGenerator> = match build_generator(&cfg)? {
        Some(g) => g,
        None => Arc::new(StubGenerator::default()),
    };

    let root = artifacts_root(args.artifacts);
    let run_dir = root.join(uuid_dir());
    std::fs::create_dir_all(&run_dir)?;

    let runner = GoldenCaptureRunner::new(cfg.repo_dir.clone(), run_dir.join("logs/golden"))
        .with_source_dirs(cfg.source_dirs.clone())
        .with_timeout(Duration::from_secs(cfg.timeout_secs))
        .with_parallel(cfg.parallel);
    let snapshot = runner
        .run(&cfg.inputs, &cfg.entries, &cfg.guidance, strategy, generator)
        .await?;

    let out = run_dir.join("golden_snapshot.json");
    std::fs::write(&out, serde_json::to_string_pretty(&snapshot)?)?;
    eprintln!(
        "captured {} golden records -> {}",
        snapshot.records.len(),
        out.display()
    );
    Ok(exit_codes::OK)
}

async fn compare(args: CompareArgs, registry: &StrategyRegistry) -> anyhow::Result<i32> {
    let cfg = RunConfig::from_yaml_file(&args.config)?;
    let strategy = registry.resolve(&cfg.ecosystem)?;
    let Some(refactored) = cfg.refactored_repo_dir.clone() else {
        return Err(equiv_core::EngineError::Config(
            "compare requires refactored_repo_dir in the config".into(),
        )
        .into());
    };

    let text = std::fs::read_to_string(&args.snapshot).map_err(|e| {
        equiv_core::EngineError::Config(format!(
            "failed to read snapshot {}: {e}",
            args.snapshot.display()
        ))
    })?;
    let golden: GoldenSnapshot = serde_json::from_str(&text).map_err(|e| {
        equiv_core::EngineError::Config(format!(
            "failed to parse snapshot {}: {e}",
            args.snapshot.display()
        ))
    })?;

    let generator: Arc<dyn TextGenerator> = match build_generator(&cfg)? {
        Some(g) => g,
        None => Arc::new(StubGenerator::default()),
    };

    let run_id = uuid_dir();
    let root = artifacts_root(args.artifacts);
    let run_dir = root.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;

    let comparator = GoldenComparator::new(refactored, run_dir.join("logs"))
        .with_source_dirs(cfg.source_dirs.clone())
        .with_timeout(Duration::from_secs(cfg.timeout_secs));
    let results = comparator
        .run(
            &cfg.inputs,
            &cfg.entries,
            &cfg.guidance,
            &golden,
            strategy,
            generator,
        )
        .await?;

    let report = ReportBuilder::new().build(&run_id, golden, results, Vec::new());
    report::write_json(&report, &run_dir.join("overall_report.json"))?;
    report::print_summary(&report);
    Ok(report_exit_code(&report))
}

async fn check_build(args: CheckBuildArgs, registry: &StrategyRegistry) -> anyhow::Result<i32> {
    let strategy = registry.resolve(&args.ecosystem)?;
    let timeout = Duration::from_secs(args.timeout_secs);
    let repo = args.repo.clone();
    let (ok, diagnostic) =
        tokio::task::spawn_blocking(move || strategy.check_build(&repo, timeout)).await?;
    eprintln!("{diagnostic}");
    if ok {
        eprintln!("build check passed");
        Ok(exit_codes::OK)
    } else {
        eprintln!("build check failed");
        Ok(exit_codes::TEST_FAILURE)
    }
}

fn uuid_dir() -> String {
    // The CLI labels ad-hoc capture/compare runs the same way the pipeline
    // labels full runs.
    uuid::Uuid::new_v4().simple().to_string()
}
