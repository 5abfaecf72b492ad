// Run external commands (git, docker build/compose) with typed failures.

use std::path::Path;
use tokio::process::Command;

use crate::error::RuntimeError;

/// Keep only the tail of stderr in failure reasons; build logs can be huge.
const STDERR_TAIL_BYTES: usize = 2048;

/// Run `program args..` (optionally in `cwd`, with extra env) and return trimmed stdout.
/// A non-zero exit becomes `RuntimeError::CommandFailed` with the stderr tail.
pub async fn run(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &[(String, String)],
) -> Result<String, RuntimeError> {
    let label = format!("{} {}", program, args.first().copied().unwrap_or_default())
        .trim()
        .to_string();
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in envs {
        cmd.env(k, v);
    }
    tracing::debug!(command = %label, ?args, "running command");

    let output = cmd.output().await.map_err(|e| RuntimeError::Spawn {
        command: label.clone(),
        reason: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(RuntimeError::CommandFailed {
            command: label,
            code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_returns_stdout() {
        let out = run("sh", &["-c", "echo hello"], None, &[]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code_and_stderr() {
        let err = run("sh", &["-c", "echo broken >&2; exit 1"], None, &[])
            .await
            .unwrap_err();
        match err {
            RuntimeError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let envs = vec![("FLEET_TEST_VAR".to_string(), "42".to_string())];
        let out = run("sh", &["-c", "echo $FLEET_TEST_VAR"], None, &envs)
            .await
            .unwrap();
        assert_eq!(out, "42");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run("definitely-not-a-real-binary-xyz", &[], None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[test]
    fn long_stderr_is_truncated_to_tail() {
        let long = "x".repeat(STDERR_TAIL_BYTES * 2);
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES + 3);
    }
}
