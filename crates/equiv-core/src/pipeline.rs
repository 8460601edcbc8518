//! End-to-end orchestration.
//!
//! One run produces one artifact directory:
//!
//! ```text
//! <artifacts_root>/<run_id>/
//!   golden_snapshot.json
//!   overall_report.json
//!   emitted/                  generated test files
//!   logs/golden/<input_id>/   probe script + execution log per input
//!   logs/refactored/...       same, for the refactored tree
//!   logs/unit_test/           native-runner logs per emitted file
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::GoldenCaptureRunner;
use crate::compare::GoldenComparator;
use crate::emit::{TestEmitter, TestExecutor};
use crate::generator::{StubGenerator, TextGenerator};
use crate::model::{OverallTestReport, RunConfig};
use crate::report::{self, ReportBuilder};
use crate::strategy::StrategyRegistry;

/// Build checks type-check a whole tree; they get a heavier budget than a
/// single probe.
const BUILD_CHECK_TIMEOUT: Duration = Duration::from_secs(600);

/// Run the full characterization pipeline.
///
/// Per-input and per-file failures are absorbed into the report; the only
/// errors surfaced here are configuration problems (unknown ecosystem) and
/// process-level resource failures (cannot create the artifact tree).
pub async fn run_characterization(
    cfg: &RunConfig,
    registry: &StrategyRegistry,
    generator: Option<Arc<dyn TextGenerator>>,
    artifacts_root: &Path,
) -> anyhow::Result<OverallTestReport> {
    let strategy = registry.resolve(&cfg.ecosystem)?;
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let started_at = chrono::Utc::now().to_rfc3339();

    let run_dir = artifacts_root.join(&run_id);
    let emitted_dir = run_dir.join("emitted");
    let logs_dir = run_dir.join("logs");
    std::fs::create_dir_all(&emitted_dir)?;
    std::fs::create_dir_all(&logs_dir)?;

    tracing::info!(
        run_id = %run_id,
        ecosystem = %cfg.ecosystem,
        inputs = cfg.inputs.len(),
        "starting characterization run"
    );

    // Probe generation always goes through a TextGenerator; without a real
    // collaborator the deterministic stub keeps the pipeline runnable.
    let capture_generator: Arc<dyn TextGenerator> = generator
        .clone()
        .unwrap_or_else(|| Arc::new(StubGenerator::default()));

    // Build gate on the refactored tree. Recorded as data; a broken build
    // still produces a full report.
    let mut build_success = None;
    let mut build_error = None;
    if let Some(refactored) = &cfg.refactored_repo_dir {
        let (ok, diagnostic) = {
            let strategy = strategy.clone();
            let refactored = refactored.clone();
            tokio::task::spawn_blocking(move || {
                strategy.check_build(&refactored, BUILD_CHECK_TIMEOUT)
            })
            .await?
        };
        tracing::info!(ok, "build check on refactored tree");
        build_success = Some(ok);
        if !ok {
            tracing::warn!(
                kind = %crate::errors::FailureKind::BuildFailure,
                "refactored tree does not build"
            );
            build_error = Some(diagnostic);
        }
    }

    // Golden capture against the original tree.
    let capture = GoldenCaptureRunner::new(cfg.repo_dir.clone(), logs_dir.join("golden"))
        .with_source_dirs(cfg.source_dirs.clone())
        .with_timeout(Duration::from_secs(cfg.timeout_secs))
        .with_parallel(cfg.parallel);
    let golden = capture
        .run(
            &cfg.inputs,
            &cfg.entries,
            &cfg.guidance,
            strategy.clone(),
            capture_generator.clone(),
        )
        .await?;
    write_pretty(&run_dir.join("golden_snapshot.json"), &golden)?;
    tracing::info!(records = golden.records.len(), "golden capture complete");

    // Comparison against the refactored tree, when one is given.
    let comparison_results = if let Some(refactored) = &cfg.refactored_repo_dir {
        let comparator = GoldenComparator::new(refactored.clone(), logs_dir.clone())
            .with_source_dirs(cfg.source_dirs.clone())
            .with_timeout(Duration::from_secs(cfg.timeout_secs))
            .with_parallel(cfg.parallel);
        comparator
            .run(
                &cfg.inputs,
                &cfg.entries,
                &cfg.guidance,
                &golden,
                strategy.clone(),
                capture_generator.clone(),
            )
            .await?
    } else {
        Vec::new()
    };

    // Emit characterization tests against the tree they will run on.
    let test_target = cfg
        .refactored_repo_dir
        .clone()
        .unwrap_or_else(|| cfg.repo_dir.clone());
    let emitter = TestEmitter::new(test_target.clone());
    let emitted = emitter
        .emit(
            &cfg.inputs,
            &cfg.entries,
            &cfg.guidance,
            &golden,
            strategy.as_ref(),
            generator.as_deref(),
        )
        .await;
    for file in &emitted {
        let name = Path::new(&file.path)
            .file_name()
            .map_or_else(|| file.path.clone(), |n| n.to_string_lossy().into_owned());
        std::fs::write(emitted_dir.join(name), &file.content)?;
    }
    tracing::info!(files = emitted.len(), "test emission complete");

    // Execute emitted tests one file at a time, each under its own budget.
    let executor = TestExecutor::new(
        test_target,
        emitted_dir.clone(),
        logs_dir.join("unit_test"),
    )
    .with_source_dirs(cfg.source_dirs.clone())
    .with_timeout(Duration::from_secs(cfg.test_timeout_secs));
    let executor = Arc::new(executor);

    let mut unit_test_results = Vec::with_capacity(emitted.len());
    for file in emitted {
        let executor = executor.clone();
        let strategy = strategy.clone();
        let result =
            tokio::task::spawn_blocking(move || executor.run(&file, strategy.as_ref())).await?;
        unit_test_results.push(result);
    }

    let mut report = ReportBuilder::new().build(
        &run_id,
        golden,
        comparison_results,
        unit_test_results,
    );
    report.started_at = Some(started_at);
    report.build_success = build_success;
    report.build_error = build_error;

    report::write_json(&report, &run_dir.join("overall_report.json"))?;
    tracing::info!(
        pass_rate = report.pass_rate,
        total = report.total,
        "characterization run complete"
    );

    Ok(report)
}

/// Default artifact root when the caller does not pick one.
pub fn default_artifacts_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn write_pretty<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
