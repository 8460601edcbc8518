//! Target strategies: the per-ecosystem toolchain contract.
//!
//! One [`TargetStrategy`] per language ecosystem, all implementing the same
//! six operations (probe generation, probe execution, test generation, test
//! execution, build check, output parsing). Every operation is total: it
//! returns a result object, never propagates a toolchain failure.

pub mod exec;
mod go;
mod python;
mod rust;

pub use go::GoStrategy;
pub use python::PythonStrategy;
pub use rust::RustStrategy;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::EngineError;
use crate::generator::TextGenerator;
use crate::model::{TestGuidance, TestItemResult, TestItemStatus, TestRunResult};

/// Uniform shape of a parsed native-runner report.
#[derive(Debug, Clone, Default)]
pub struct ParsedTestOutput {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub items: Vec<TestItemResult>,
}

/// Toolchain contract for one language ecosystem.
#[async_trait]
pub trait TargetStrategy: Send + Sync {
    /// Ecosystem identifier ("python", "rust", "go").
    fn id(&self) -> &'static str;

    /// Source file extension including the dot (".py", ".rs", ".go").
    fn source_extension(&self) -> &'static str;

    /// File name for a generated probe script.
    fn probe_file_name(&self, stem: &str) -> String {
        format!("{stem}_probe{}", self.source_extension())
    }

    /// File name for a generated test artifact, following the ecosystem's
    /// test-discovery convention.
    fn test_file_name(&self, stem: &str) -> String;

    /// Generate a probe script through the text-generation collaborator,
    /// with markdown fencing stripped from the response.
    async fn generate_probe_script(
        &self,
        source_code: &str,
        module_paths: &[String],
        dep_signatures: &str,
        guidance: Option<&TestGuidance>,
        generator: &dyn TextGenerator,
    ) -> anyhow::Result<String>;

    /// Compile (if the ecosystem requires it) and execute a probe script
    /// under a wall-clock timeout, collecting coverage when the toolchain
    /// supports it. Timeout: exit -1, stderr "TIMEOUT". Compile failure:
    /// compiler exit code, diagnostic prefixed "compilation failed".
    fn run_with_coverage(
        &self,
        script_path: &Path,
        work_dir: &Path,
        source_dirs: &[String],
        timeout: Duration,
    ) -> TestRunResult;

    /// Generate a characterization test file, golden values embedded.
    async fn generate_test_file(
        &self,
        new_source_code: &str,
        module_paths: &[String],
        golden_values: &serde_json::Map<String, serde_json::Value>,
        dep_signatures: &str,
        guidance: Option<&TestGuidance>,
        generator: &dyn TextGenerator,
    ) -> anyhow::Result<String>;

    /// Execute the ecosystem's native test runner against one test file.
    fn run_tests(
        &self,
        test_file_path: &Path,
        work_dir: &Path,
        source_dirs: &[String],
        timeout: Duration,
    ) -> TestRunResult;

    /// Verify that the whole tree compiles/type-checks. A tree with no
    /// files in this ecosystem passes with "No <ecosystem> files found".
    fn check_build(&self, repo_dir: &Path, timeout: Duration) -> (bool, String);

    /// Parse the native runner's textual report into uniform per-test items.
    fn parse_test_output(&self, stdout: &str, stderr: &str, exit_code: i32) -> ParsedTestOutput;
}

/// Caller-owned table of ecosystem id → strategy.
///
/// Built once at start-up and passed by dependency injection; nothing in
/// the engine mutates it during a run.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn TargetStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in strategies.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PythonStrategy::new()));
        registry.register(Arc::new(RustStrategy::new()));
        registry.register(Arc::new(GoStrategy::new()));
        registry
    }

    /// Register a strategy under its own id. Last write wins.
    pub fn register(&mut self, strategy: Arc<dyn TargetStrategy>) {
        self.strategies.insert(strategy.id().to_string(), strategy);
    }

    pub fn resolve(&self, ecosystem: &str) -> Result<Arc<dyn TargetStrategy>, EngineError> {
        self.strategies
            .get(ecosystem)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEcosystem(ecosystem.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

// ---------------------------------------------------------------------------
// System prompts shared by every strategy's generation calls
// ---------------------------------------------------------------------------

pub(crate) const SYSTEM_GOLDEN_SCRIPT: &str = "\
You are a senior test engineer specializing in characterization testing.

Your role:
- Generate executable scripts that capture behavioral snapshots of software
- Ensure comprehensive coverage of all public APIs
- Produce clean, parseable output for automated verification

Quality standards:
- Use descriptive test keys (TypeName_methodName_scenario)
- Never use generic keys like \"result1\", \"test1\", \"output\"
- Handle all edge cases systematically
- Prioritize correctness and completeness over brevity
- Output must be machine-parseable (JSON format)

Principles:
- The script must be self-contained and executable
- Minimize external dependencies
- Focus on observable behavior, not implementation details
";

pub(crate) const SYSTEM_TEST_GENERATION: &str = "\
You are a senior test engineer specializing in cross-language refactoring validation.

Your role:
- Generate tests that prove behavioral equivalence for the original and refactored code
- Ensure the refactored implementation matches the original behavior exactly
- Create maintainable test code that follows language conventions

Quality standards:
- Tests must be deterministic and repeatable
- Use same package name as source code (no separate test packages)
- Follow language-specific testing idioms
- Provide clear, actionable error messages
- Cover all scenarios from golden output

Principles:
- Behavior changes are bugs until proven otherwise
- Focus on observable outputs, not internal implementation
- Every golden value must have a corresponding test assertion
";

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Strip markdown code fencing from a generator response.
///
/// Accepts an optional language tag on the opening fence (```python,
/// ```rust, ```rs, ```go, or bare ```).
pub(crate) fn strip_code_fences(text: &str) -> String {
    let mut script = text.trim();
    if script.starts_with("```") {
        script = match script.find('\n') {
            Some(idx) => &script[idx + 1..],
            None => &script[3..],
        };
    }
    let mut script = script.trim();
    if let Some(stripped) = script.strip_suffix("```") {
        script = stripped.trim_end();
    }
    script.to_string()
}

/// Render one guidance field for prompt interpolation; "none" when absent.
pub(crate) fn guidance_list(values: &[String]) -> String {
    if values.is_empty() {
        "none".to_string()
    } else {
        values.join(", ")
    }
}

pub(crate) fn guidance_notes(guidance: Option<&TestGuidance>) -> String {
    guidance
        .and_then(|g| g.nondeterminism_notes.clone())
        .unwrap_or_else(|| "none".to_string())
}

pub(crate) fn guidance_side_effects(guidance: Option<&TestGuidance>) -> String {
    guidance.map_or_else(|| "none".to_string(), |g| guidance_list(&g.side_effects))
}

pub(crate) fn guidance_mocks(guidance: Option<&TestGuidance>) -> String {
    guidance.map_or_else(
        || "none".to_string(),
        |g| guidance_list(&g.mock_recommendations),
    )
}

/// Wrap aggregated source into path-labeled sections for prompts. Single
/// files get the full label block; multi-file aggregates arrive already
/// formatted by the caller.
pub(crate) fn build_file_sections(
    source_code: &str,
    module_paths: &[String],
    lang_tag: &str,
) -> String {
    if module_paths.len() == 1 {
        let path = Path::new(&module_paths[0]);
        let dir = path.parent().map_or_else(String::new, |p| p.display().to_string());
        let stem = path
            .file_stem()
            .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
        format!(
            "File: {}\nDirectory: {}\nModule name: {}\n```{}\n{}\n```",
            module_paths[0], dir, stem, lang_tag, source_code
        )
    } else {
        source_code.to_string()
    }
}

/// True when the tree contains at least one file with `ext` (recursive).
pub(crate) fn tree_has_extension(repo_dir: &Path, ext: &str) -> bool {
    fn walk(dir: &Path, ext: &str) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if walk(&path, ext) {
                    return true;
                }
            } else if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                return true;
            }
        }
        false
    }
    walk(repo_dir, ext)
}

/// Collect every path in the tree whose file name matches `name`.
pub(crate) fn find_files_named(repo_dir: &Path, name: &str) -> Vec<std::path::PathBuf> {
    fn walk(dir: &Path, name: &str, acc: &mut Vec<std::path::PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, name, acc);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(name) {
                acc.push(path);
            }
        }
    }
    let mut acc = Vec::new();
    walk(repo_dir, name, &mut acc);
    acc.sort();
    acc
}

/// Fallback for unparseable runner output: one synthetic errored item so a
/// crashed suite is never reported as "zero tests, all fine".
pub(crate) fn synthetic_errored(stderr: &str) -> ParsedTestOutput {
    tracing::debug!(
        kind = %crate::errors::FailureKind::ParseFailure,
        "runner output unparseable with nonzero exit, recording synthetic error"
    );
    let mut reason = if stderr.trim().is_empty() {
        "test runner produced no parseable output".to_string()
    } else {
        stderr.trim().to_string()
    };
    crate::truncate_in_place(&mut reason, 500);
    ParsedTestOutput {
        passed: 0,
        failed: 0,
        errored: 1,
        items: vec![TestItemResult {
            test_name: "<suite>".to_string(),
            status: TestItemStatus::Error,
            failure_reason: Some(reason),
        }],
    }
}
