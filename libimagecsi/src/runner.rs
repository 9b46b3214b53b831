//! External command execution with an optional deadline.
//!
//! [`CommandRunner`] spawns exactly one child per call, captures its stdout and
//! stderr, and reports one of three outcomes: success, failure (spawn error or
//! non-zero exit), or [`RunError::Timeout`].  A timed-out child is killed and
//! reaped before the timeout is reported, so a hung tool never outlives the
//! call that started it.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Failure modes of [`CommandRunner::run`].
#[derive(Debug, Error)]
pub enum RunError {
    /// The executable could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran but exited unsuccessfully.
    #[error("{program} exited with {status}: {output}")]
    Failed {
        program: String,
        status: ExitStatus,
        /// stdout followed by stderr.
        output: String,
    },

    /// The command did not complete before the deadline.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// Waiting on the child or reading its pipes failed.
    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        combine(&self.stdout, &self.stderr)
    }

    /// stdout with surrounding whitespace removed.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_owned()
    }
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).into_owned();
    out.push_str(&String::from_utf8_lossy(stderr));
    out.trim().to_owned()
}

/// Runs external tools, optionally bounded by a timeout.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    /// A zero timeout means no deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|t| !t.is_zero()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `program` with `args` and wait for it to exit.
    pub async fn run<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<CommandOutput, RunError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        debug!(program, ?args, timeout = ?self.timeout, "running command");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.to_owned(),
                source,
            })?;

        let io_err = |source| RunError::Io {
            program: program.to_owned(),
            source,
        };
        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("stdout not captured")))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("stderr not captured")))?;

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (status, out, err) = tokio::join!(
                child.wait(),
                stdout_pipe.read_to_end(&mut stdout),
                stderr_pipe.read_to_end(&mut stderr),
            );
            out?;
            err?;
            Ok::<_, std::io::Error>(CommandOutput {
                status: status?,
                stdout,
                stderr,
            })
        };

        let collected = match self.timeout {
            Some(timeout) => {
                let outcome = tokio::time::timeout(timeout, collect).await;
                match outcome {
                    Ok(collected) => collected,
                    Err(_) => {
                        // kill() also waits, so the child is reaped here.
                        if let Err(e) = child.kill().await {
                            warn!(program, error = %e, "failed to kill timed-out command");
                        }
                        return Err(RunError::Timeout {
                            program: program.to_owned(),
                            timeout,
                        });
                    }
                }
            }
            None => collect.await,
        };

        let output = collected.map_err(io_err)?;
        if !output.status.success() {
            return Err(RunError::Failed {
                program: program.to_owned(),
                status: output.status,
                output: output.combined(),
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn captures_stdout() {
        let runner = CommandRunner::new(None);
        let out = runner.run("sh", &["-c", "echo sha256:abc"]).await.unwrap();
        assert_eq!(out.stdout_trimmed(), "sha256:abc");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_combined_output() {
        let runner = CommandRunner::new(Some(Duration::from_secs(10)));
        let err = runner
            .run("sh", &["-c", "echo out; echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            RunError::Failed { status, output, .. } => {
                assert_eq!(status.code(), Some(3));
                assert!(output.contains("out"));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let runner = CommandRunner::new(None);
        let err = runner
            .run::<&str>("/nonexistent/imagecsi-tool", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[tokio::test]
    async fn one_nanosecond_timeout_reports_timeout() {
        let runner = CommandRunner::new(Some(Duration::from_nanos(1)));
        let started = Instant::now();
        let err = runner.run("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, RunError::Timeout { .. }));
        // The child was killed rather than waited out.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        assert_eq!(CommandRunner::new(Some(Duration::ZERO)).timeout(), None);
    }
}
