//! Golden capture: execute probes against a source tree and record the
//! observable outcome per test input.
//!
//! Capture is strictly per-input: one input's failure (generation error,
//! crash, timeout) becomes an error-bearing [`GoldenRecord`] and never
//! aborts the remaining inputs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::TIMEOUT_MARKER;
use crate::generator::TextGenerator;
use crate::model::{EntryPoint, GoldenRecord, GoldenSnapshot, TestGuidance, TestInput};
use crate::strategy::TargetStrategy;
use crate::truncate_in_place;

/// Executes probe scripts against one source tree, producing golden records.
#[derive(Clone)]
pub struct GoldenCaptureRunner {
    pub repo_dir: PathBuf,
    /// Per-input scoped subdirectories (script + execution log) live here.
    pub logs_dir: PathBuf,
    pub source_dirs: Vec<String>,
    pub timeout: Duration,
    pub parallel: usize,
}

impl GoldenCaptureRunner {
    pub fn new(repo_dir: PathBuf, logs_dir: PathBuf) -> Self {
        Self {
            repo_dir,
            logs_dir,
            source_dirs: Vec::new(),
            timeout: Duration::from_secs(30),
            parallel: 4,
        }
    }

    #[must_use]
    pub fn with_source_dirs(mut self, source_dirs: Vec<String>) -> Self {
        self.source_dirs = source_dirs;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    /// Capture golden output for every input, in input order.
    ///
    /// Inputs run concurrently up to the worker limit; each gets a disjoint
    /// work directory under `logs_dir`, so captures never share mutable
    /// state. Results come back sorted into the original input order.
    pub async fn run(
        &self,
        inputs: &[TestInput],
        entries: &[EntryPoint],
        guidance: &[TestGuidance],
        strategy: Arc<dyn TargetStrategy>,
        generator: Arc<dyn TextGenerator>,
    ) -> anyhow::Result<GoldenSnapshot> {
        std::fs::create_dir_all(&self.logs_dir)?;

        let sem = Arc::new(Semaphore::new(self.parallel));
        let mut join_set = JoinSet::new();
        let entries: Arc<[EntryPoint]> = entries.to_vec().into();
        let guidance: Arc<[TestGuidance]> = guidance.to_vec().into();

        for (idx, input) in inputs.iter().enumerate() {
            let permit = sem.clone().acquire_owned().await?;
            let this = self.clone();
            let input = input.clone();
            let entries = entries.clone();
            let guidance = guidance.clone();
            let strategy = strategy.clone();
            let generator = generator.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let record = this
                    .capture_one(&input, &entries, &guidance, &strategy, generator.as_ref())
                    .await;
                (idx, record)
            });
        }

        let mut indexed: Vec<(usize, GoldenRecord)> = Vec::with_capacity(inputs.len());
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(pair) => indexed.push(pair),
                Err(e) => {
                    // A panicked capture task loses its index; record it the
                    // same way a crashed probe is recorded.
                    tracing::warn!(error = %e, "capture task failed");
                    indexed.push((
                        usize::MAX,
                        error_record("unknown", "unknown", format!("task error: {e}")),
                    ));
                }
            }
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        Ok(GoldenSnapshot {
            records: indexed.into_iter().map(|(_, r)| r).collect(),
        })
    }

    async fn capture_one(
        &self,
        input: &TestInput,
        entries: &[EntryPoint],
        guidance: &[TestGuidance],
        strategy: &Arc<dyn TargetStrategy>,
        generator: &dyn TextGenerator,
    ) -> GoldenRecord {
        let Some(entry) = entries.iter().find(|e| e.entry_id == input.entry_id) else {
            return error_record(
                &input.input_id,
                &input.entry_id,
                format!("no entry point for entry_id {}", input.entry_id),
            );
        };

        let source_file = crate::model::SourceFile {
            path: entry.module_path.clone(),
            ecosystem: strategy.id().to_string(),
        };
        let source_code = match source_file.read_content(&self.repo_dir) {
            Ok(code) => code,
            Err(e) => {
                return error_record(
                    &input.input_id,
                    &input.entry_id,
                    format!("failed to read {}: {e}", entry.module_path),
                )
            }
        };

        let module_guidance = guidance.iter().find(|g| g.module_path == entry.module_path);
        let mut dep_context = entry.dep_signatures.clone().unwrap_or_default();
        if !dep_context.is_empty() {
            dep_context.push_str("\n\n");
        }
        dep_context.push_str(&scenario_context(entry, input));

        let script = match strategy
            .generate_probe_script(
                &source_code,
                std::slice::from_ref(&entry.module_path),
                &dep_context,
                module_guidance,
                generator,
            )
            .await
        {
            Ok(script) => script,
            Err(e) => {
                tracing::warn!(input_id = %input.input_id, error = %e, "probe generation failed");
                return error_record(
                    &input.input_id,
                    &input.entry_id,
                    format!("probe generation failed: {e}"),
                );
            }
        };

        let work_dir = self.logs_dir.join(&input.input_id);
        if let Err(e) = std::fs::create_dir_all(&work_dir) {
            return error_record(
                &input.input_id,
                &input.entry_id,
                format!("failed to create work dir: {e}"),
            );
        }
        let script_path = work_dir.join(strategy.probe_file_name(&safe_name(&entry.module_path)));
        if let Err(e) = std::fs::write(&script_path, &script) {
            return error_record(
                &input.input_id,
                &input.entry_id,
                format!("failed to write probe script: {e}"),
            );
        }

        let started = Instant::now();
        let result = {
            let strategy = strategy.clone();
            let script_path = script_path.clone();
            let repo_dir = self.repo_dir.clone();
            let source_dirs = self.source_dirs.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || {
                strategy.run_with_coverage(&script_path, &repo_dir, &source_dirs, timeout)
            })
            .await
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                return error_record(
                    &input.input_id,
                    &input.entry_id,
                    format!("probe execution failed: {e}"),
                )
            }
        };

        let log_path = work_dir.join("execution.log");
        let log = format!(
            "cmd: {} run_with_coverage {}\nexit_code: {}\n\nstdout:\n{}\n\nstderr:\n{}",
            strategy.id(),
            script_path.display(),
            result.exit_code,
            result.stdout,
            result.stderr,
        );
        if let Err(e) = std::fs::write(&log_path, log) {
            tracing::warn!(input_id = %input.input_id, error = %e, "failed to persist execution log");
        }

        let timed_out = result.exit_code == -1 && result.stderr == TIMEOUT_MARKER;
        if timed_out {
            tracing::warn!(
                input_id = %input.input_id,
                kind = %crate::errors::FailureKind::Timeout,
                "probe exceeded its time budget"
            );
        }
        let output = if timed_out {
            None
        } else {
            parse_probe_output(&result.stdout)
        };

        let stderr_snippet = if result.stderr.is_empty() {
            None
        } else {
            let mut s = result.stderr.clone();
            truncate_in_place(&mut s, 500);
            Some(s)
        };

        GoldenRecord {
            input_id: input.input_id.clone(),
            entry_id: input.entry_id.clone(),
            output,
            exit_code: Some(result.exit_code),
            stderr_snippet,
            duration_ms: Some(duration_ms),
            coverage_pct: result.coverage_pct,
        }
    }
}

/// Scenario block handed to probe generation alongside dependency context.
fn scenario_context(entry: &EntryPoint, input: &TestInput) -> String {
    let args = serde_json::to_string(&input.args).unwrap_or_else(|_| "{}".to_string());
    let mut ctx = format!(
        "Invocation scenario for {}: args={}",
        entry.function_name, args
    );
    if let Some(desc) = &input.description {
        ctx.push_str(&format!(" ({desc})"));
    }
    if let Some(sig) = &entry.signature {
        ctx.push_str(&format!("\nSignature: {sig}"));
    }
    ctx
}

/// Parse probe stdout: the trailing non-empty line as JSON, falling back to
/// the whole stdout, falling back to the raw text.
fn parse_probe_output(stdout: &str) -> Option<serde_json::Value> {
    let text = stdout.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(last_line) = text.lines().last() {
        if let Ok(value) = serde_json::from_str(last_line.trim()) {
            return Some(value);
        }
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    Some(serde_json::Value::String(text.to_string()))
}

fn error_record(input_id: &str, entry_id: &str, message: String) -> GoldenRecord {
    let mut msg = message;
    truncate_in_place(&mut msg, 500);
    GoldenRecord {
        input_id: input_id.to_string(),
        entry_id: entry_id.to_string(),
        output: None,
        exit_code: None,
        stderr_snippet: Some(msg),
        duration_ms: None,
        coverage_pct: None,
    }
}

/// Flatten a module path into a file-name-safe stem.
fn safe_name(module_path: &str) -> String {
    module_path.replace(['/', '\\', '.'], "_")
}
