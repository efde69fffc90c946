//! Blocking-style execution of external commands (`xm`, `virsh`, `sudo`,
//! `ssh`, `curl`, ...).
//!
//! Every invocation is bounded by a timeout. The child is spawned with
//! `kill_on_drop`, so when the timeout elapses and the wait future is dropped
//! the child receives SIGKILL. There is no other cancellation mechanism.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the child was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, for marker matching.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Short description for error messages.
    pub fn describe(&self) -> String {
        let status = self
            .status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = self.combined();
        format!("exit {status}: {}", detail.trim())
    }
}

/// Runs external programs, optionally behind a privilege-escalation prefix.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    sudo: Option<PathBuf>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(sudo: Option<PathBuf>, timeout: Duration) -> Self {
        Self { sudo, timeout }
    }

    /// A runner that executes programs directly.
    pub fn direct(timeout: Duration) -> Self {
        Self::new(None, timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Copy of this runner with a different timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            sudo: self.sudo.clone(),
            timeout,
        }
    }

    /// The argv that will actually be executed.
    pub fn argv(&self, program: &Path, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if let Some(sudo) = &self.sudo {
            argv.push(sudo.display().to_string());
        }
        argv.push(program.display().to_string());
        argv.extend(args.iter().cloned());
        argv
    }

    /// Run `program args...` and capture its output. A non-zero exit status is
    /// not an error here; callers inspect [`CommandOutput`].
    pub async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput> {
        self.run_inner(program, args, None).await
    }

    /// Like [`CommandRunner::run`] but feeds `input` on stdin.
    pub async fn run_with_stdin(
        &self,
        program: &Path,
        args: &[String],
        input: &str,
    ) -> Result<CommandOutput> {
        self.run_inner(program, args, Some(input)).await
    }

    /// Run and map a non-zero exit status to `Err`.
    pub async fn run_checked(
        &self,
        program: &Path,
        args: &[String],
        label: &str,
    ) -> Result<CommandOutput> {
        let output = self.run(program, args).await?;
        if !output.success() {
            bail!("`{}` failed during {label} ({})", program.display(), output.describe());
        }
        Ok(output)
    }

    async fn run_inner(
        &self,
        program: &Path,
        args: &[String],
        input: Option<&str>,
    ) -> Result<CommandOutput> {
        let argv = self.argv(program, args);
        debug!(command = %argv.join(" "), "running external command");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", argv[0]))?;

        if let Some(input) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .with_context(|| format!("writing stdin of `{}`", argv[0]))?;
                // Dropping stdin closes the pipe so the child sees EOF.
            }
        }

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                let output =
                    result.with_context(|| format!("failed waiting for `{}`", argv[0]))?;
                Ok(CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                warn!(
                    command = %argv.join(" "),
                    timeout_secs = self.timeout.as_secs_f64(),
                    "external command timed out, child killed"
                );
                bail!(
                    "`{}` timed out after {:.1}s",
                    argv.join(" "),
                    self.timeout.as_secs_f64()
                )
            }
        }
    }
}
