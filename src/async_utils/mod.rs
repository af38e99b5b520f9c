//! Asynchronous utilities for use with Tokio.
//!
//! We shell out to `tesseract` and `pdftocairo`, and we do some CPU-heavy image
//! work. Both need a little care to avoid blocking the executor.

use std::process::Output;

use crate::prelude::*;

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And standard error may be optionally checked with
/// `is_error_line` to determine if the command failed even though it exited
/// successfully.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line {
            if stderr.lines().any(is_error_line) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Blocking tasks are only cancelled when the runtime shuts down.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt as _;
    use std::process::ExitStatus;

    use super::*;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn successful_command_passes() {
        assert!(check_for_command_failure("true", &output(0, ""), None).is_ok());
    }

    #[test]
    fn exit_code_is_reported() {
        let err = check_for_command_failure("false", &output(2, "oops"), None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 2"));
        assert!(err.contains("oops"));
    }

    #[test]
    fn error_lines_fail_successful_commands() {
        let is_error_line = |line: &str| line.starts_with("Error");
        let out = output(0, "Warning: odd\nError: bad xref");
        assert!(check_for_command_failure("cmd", &out, Some(&is_error_line)).is_err());
        let out = output(0, "Warning: odd");
        assert!(check_for_command_failure("cmd", &out, Some(&is_error_line)).is_ok());
    }

    #[tokio::test]
    async fn spawn_blocking_returns_value() {
        assert_eq!(spawn_blocking_propagating_panics(|| 2 + 2).await, 4);
    }
}
