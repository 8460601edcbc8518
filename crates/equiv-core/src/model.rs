//! Data model for the characterization-testing pipeline.
//!
//! Everything here is plain serde data: phases communicate through these
//! types and through JSON artifacts on disk, never through shared state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A unit of code under test, as classified by the upstream file filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the repo root.
    pub path: String,
    /// Ecosystem identifier ("python", "rust", "go", ...).
    pub ecosystem: String,
}

impl SourceFile {
    /// Read the file content from disk, replacing invalid UTF-8.
    pub fn read_content(&self, repo_dir: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(repo_dir.join(&self.path))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A testable entry point detected by the upstream entry detector.
///
/// Consumed read-only; `entry_id` is the join target for [`TestInput`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPoint {
    pub entry_id: String,
    /// Path of the module that owns this entry, relative to the repo root.
    pub module_path: String,
    pub function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    /// Signatures of the modules this entry imports, as rendered by the
    /// upstream dependency-graph extractor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dep_signatures: Option<String>,
}

/// Per-module testing advice produced by the upstream guidance generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestGuidance {
    pub module_path: String,
    #[serde(default)]
    pub side_effects: Vec<String>,
    #[serde(default)]
    pub mock_recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nondeterminism_notes: Option<String>,
    #[serde(default)]
    pub external_deps: Vec<String>,
}

/// One concrete invocation scenario for an entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestInput {
    /// Unique within a run; the join key to [`GoldenRecord`].
    pub input_id: String,
    pub entry_id: String,
    /// Ordered argument mapping. serde_json's map keeps keys sorted, which
    /// keeps serialized inputs stable across runs.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Captured execution outcome of the original code for one input.
///
/// Immutable once produced. `output` is the structured document parsed from
/// the probe's stdout; `None` means the probe produced nothing parseable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenRecord {
    pub input_id: String,
    pub entry_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_pct: Option<f64>,
}

/// Ordered collection of golden records for one source tree and one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoldenSnapshot {
    #[serde(default)]
    pub records: Vec<GoldenRecord>,
}

impl GoldenSnapshot {
    pub fn get(&self, input_id: &str) -> Option<&GoldenRecord> {
        self.records.iter().find(|r| r.input_id == input_id)
    }
}

/// Terminal classification of one comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonVerdict {
    Pass,
    Fail,
    Error,
    Skipped,
}

/// Outcome of comparing one input's golden and actual records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub input_id: String,
    pub entry_id: String,
    pub verdict: ComparisonVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<String>,
}

impl ComparisonResult {
    /// Taxonomy bucket for a non-pass result, where one applies. A crash on
    /// the actual side (exit-code mismatch) stays unclassified.
    pub fn failure_kind(&self) -> Option<crate::errors::FailureKind> {
        use crate::errors::FailureKind;
        match self.verdict {
            ComparisonVerdict::Pass => None,
            ComparisonVerdict::Fail => Some(FailureKind::OutputMismatch),
            ComparisonVerdict::Skipped => Some(FailureKind::MissingRecord),
            ComparisonVerdict::Error => {
                let note = self.diff_summary.as_deref().unwrap_or("");
                if note.contains("no actual output") {
                    Some(FailureKind::MissingRecord)
                } else {
                    None
                }
            }
        }
    }
}

/// A generated test artifact, ready to be written and executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmittedTestFile {
    /// Path relative to the emitted-artifacts directory.
    pub path: String,
    pub ecosystem: String,
    pub content: String,
    /// Entries this file asserts against.
    #[serde(default)]
    pub entry_ids: Vec<String>,
}

/// Raw outcome of one toolchain invocation. Never persisted directly;
/// always folded into a [`GoldenRecord`] or [`UnitTestResult`].
#[derive(Debug, Clone)]
pub struct TestRunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub coverage_pct: Option<f64>,
}

impl TestRunResult {
    /// A process-level failure outcome: exit -1 plus a truncated message.
    pub fn failure(message: impl Into<String>) -> Self {
        let mut msg: String = message.into();
        crate::truncate_in_place(&mut msg, 500);
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: msg,
            coverage_pct: None,
        }
    }
}

/// Result of a single test function, parsed from native runner output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestItemStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestItemResult {
    pub test_name: String,
    pub status: TestItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Aggregate result of one emitted test file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTestResult {
    pub test_file: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub test_items: Vec<TestItemResult>,
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallTestReport {
    pub run_id: String,
    /// RFC 3339 wall-clock time the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub golden_snapshot: GoldenSnapshot,
    #[serde(default)]
    pub comparison_results: Vec<ComparisonResult>,
    /// passed / total over comparison results, 0.0 when there are none.
    pub pass_rate: f64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    #[serde(default)]
    pub unit_test_results: Vec<UnitTestResult>,
    /// Average unit-test line coverage across files that reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_error: Option<String>,
}

/// Settings for the text-generation collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// "stub" (default) or "openai".
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_test_timeout_secs() -> u64 {
    60
}

fn default_parallel() -> usize {
    4
}

/// YAML-loadable run configuration for the full pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Original (pre-refactor) source tree.
    pub repo_dir: PathBuf,
    /// Refactored source tree; `None` skips comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refactored_repo_dir: Option<PathBuf>,
    pub ecosystem: String,
    /// Directories used to build ecosystem search-path variables.
    #[serde(default)]
    pub source_dirs: Vec<String>,
    #[serde(default)]
    pub entries: Vec<EntryPoint>,
    #[serde(default)]
    pub inputs: Vec<TestInput>,
    #[serde(default)]
    pub guidance: Vec<TestGuidance>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

impl RunConfig {
    /// Load a run configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, crate::errors::EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::errors::EngineError::Config(format!(
                "failed to read config {}: {e}",
                path.display()
            ))
        })?;
        serde_yaml::from_str(&text).map_err(|e| {
            crate::errors::EngineError::Config(format!(
                "failed to parse config {}: {e}",
                path.display()
            ))
        })
    }

    pub fn guidance_for(&self, module_path: &str) -> Option<&TestGuidance> {
        self.guidance.iter().find(|g| g.module_path == module_path)
    }
}
