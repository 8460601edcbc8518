//! Process-execution boundary for ecosystem toolchains.
//!
//! Every strategy operation shells out through [`run_command`]: explicit
//! working directory, explicit environment overrides, hard wall-clock
//! timeout enforced by process kill. Outcomes are always data — a spawn
//! failure or timeout comes back as an [`ExecOutcome`], never a panic or a
//! propagated error, which is what keeps the strategy contract total.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::errors::TIMEOUT_MARKER;
use crate::truncate_in_place;

/// Cap on captured stdout/stderr, to bound memory against runaway output.
const STREAM_CAP: usize = 1 << 20; // 1 MiB per stream

/// Captured result of one toolchain invocation.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Exit code; -1 when the process was killed or never ran.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn timeout() -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: TIMEOUT_MARKER.to_string(),
            timed_out: true,
        }
    }

    pub fn spawn_failure(err: &std::io::Error) -> Self {
        let mut msg = err.to_string();
        truncate_in_place(&mut msg, 500);
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: msg,
            timed_out: false,
        }
    }
}

/// Run `program args...` in `cwd` with `env` overlaid on the inherited
/// environment, killing the child once `timeout` elapses.
pub fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> ExecOutcome {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env {
        cmd.env(k, v);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ExecOutcome::spawn_failure(&e),
    };

    // Drain pipes on threads so a chatty child cannot deadlock against a
    // full pipe buffer while we poll for exit.
    let stdout_handle = child.stdout.take().map(spawn_reader);
    let stderr_handle = child.stderr.take().map(spawn_reader);

    match wait_timeout(&mut child, timeout) {
        Ok(Some(status)) => {
            let stdout = join_reader(stdout_handle);
            let stderr = join_reader(stderr_handle);
            ExecOutcome {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
                timed_out: false,
            }
        }
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait(); // reap
            let _ = join_reader(stdout_handle);
            let _ = join_reader(stderr_handle);
            ExecOutcome::timeout()
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            ExecOutcome::spawn_failure(&e)
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf.truncate(STREAM_CAP);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Poll `try_wait` until the child exits or the budget elapses.
fn wait_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if start.elapsed() >= timeout {
                    return Ok(None);
                }
                std::thread::sleep(poll_interval);
            }
        }
    }
}

/// Render the command line the way it is persisted into execution logs.
pub fn render_cmd(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|a| (*a).to_string()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_command(
            "sh",
            &["-c", "echo hello; exit 3"],
            Path::new("."),
            &no_env(),
            Duration::from_secs(5),
        );
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
    }

    #[test]
    fn timeout_kills_and_reports_marker() {
        let start = Instant::now();
        let out = run_command(
            "sh",
            &["-c", "sleep 30"],
            Path::new("."),
            &no_env(),
            Duration::from_millis(200),
        );
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
        assert_eq!(out.stderr, TIMEOUT_MARKER);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_data_not_panic() {
        let out = run_command(
            "definitely-not-a-real-binary-xyz",
            &[],
            Path::new("."),
            &no_env(),
            Duration::from_secs(1),
        );
        assert_eq!(out.exit_code, -1);
        assert!(!out.stderr.is_empty());
    }

    #[test]
    fn env_overrides_reach_the_child() {
        let mut env = HashMap::new();
        env.insert("EQUIV_PROBE_VAR".to_string(), "42".to_string());
        let out = run_command(
            "sh",
            &["-c", "printf %s \"$EQUIV_PROBE_VAR\""],
            Path::new("."),
            &env,
            Duration::from_secs(5),
        );
        assert_eq!(out.stdout, "42");
    }

    #[test]
    fn render_cmd_joins_program_and_args() {
        assert_eq!(render_cmd("go", &["test", "-v"]), "go test -v");
    }
}
