// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Subprocess execution primitive used to run a test job's command.
//! A named external collaborator: classification into [`ResultType`]
//! happens here so the Worker never inspects exit codes directly.

use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::job::ResultType;

/// Outcome of running a job's command: the combined stdout/stderr and
/// the classification the coordinator expects.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Combined stdout and stderr, in arrival order.
    pub combined_output: String,
    /// Classification per the coordinator's `RESULT_TYPES` contract.
    pub result_type: ResultType,
    /// Wall-clock duration of the command.
    pub duration: std::time::Duration,
}

/// Runs a shell command to completion. Implemented behind a trait so
/// the Worker is testable without spawning real processes.
pub trait CommandRunner {
    /// Runs `command` through a shell and classifies the result.
    async fn run(&self, command: &str) -> CommandOutcome;
}

/// Spawns `command` through `/bin/sh -c`.
#[derive(Default)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str) -> CommandOutcome {
        let started = Instant::now();
        let mut child = match Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return CommandOutcome {
                    combined_output: err.to_string(),
                    result_type: ResultType::Error,
                    duration: started.elapsed(),
                };
            }
        };

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let (stdout_result, stderr_result) = tokio::join!(
            read_to_string(&mut stdout),
            read_to_string(&mut stderr),
        );

        let status = child.wait().await;
        let duration = started.elapsed();

        let stdout_text = stdout_result.unwrap_or_default();
        let stderr_text = stderr_result.unwrap_or_default();
        let combined_output = format!("{stdout_text}{stderr_text}");

        // Mirrors the original RESULT_TYPES table: a clean exit is a
        // pass; a non-zero exit with nothing on stderr is a test
        // failure; anything that wrote to stderr (or failed to run at
        // all) is an error.
        let result_type = match status {
            Ok(status) if status.success() => ResultType::Passed,
            Ok(_) if stderr_text.trim().is_empty() => ResultType::Failed,
            _ => ResultType::Error,
        };

        CommandOutcome { combined_output, result_type, duration }
    }
}

async fn read_to_string(stream: &mut (impl tokio::io::AsyncRead + Unpin)) -> std::io::Result<String> {
    let mut buf = String::new();
    stream.read_to_string(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passing_command_classified_as_passed() {
        let outcome = ShellCommandRunner.run("true").await;
        assert_eq!(outcome.result_type, ResultType::Passed);
    }

    #[tokio::test]
    async fn failing_command_with_no_stderr_classified_as_failed() {
        let outcome = ShellCommandRunner.run("exit 1").await;
        assert_eq!(outcome.result_type, ResultType::Failed);
    }

    #[tokio::test]
    async fn command_writing_to_stderr_classified_as_error() {
        let outcome = ShellCommandRunner.run("echo boom 1>&2; exit 1").await;
        assert_eq!(outcome.result_type, ResultType::Error);
    }

    #[tokio::test]
    async fn command_output_is_captured() {
        let outcome = ShellCommandRunner.run("echo hello").await;
        assert!(outcome.combined_output.contains("hello"));
    }
}
