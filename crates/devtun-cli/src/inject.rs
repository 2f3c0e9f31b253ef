//! Running the agent helper on the remote host.

use crate::ssh::BoxWriter;
use async_trait::async_trait;
use devtun_core::{PipeReader, PipeWriter, ResultExt, TunnelError, TunnelResult};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs a command on the remote host with its stdio wired to local pipes.
#[async_trait]
pub trait Injector: Send + Sync {
    async fn inject_and_execute(
        &self,
        cancel: CancellationToken,
        command: String,
        stdin: PipeReader,
        stdout: PipeWriter,
        stderr: BoxWriter,
    ) -> TunnelResult<()>;
}

/// Reaches the host through a local shell prefix such as `ssh myhost` or
/// `docker exec -i builder`: runs `sh -c "<prefix> <command>"`.
#[derive(Debug, Clone)]
pub struct ProcessInjector {
    prefix: String,
}

impl ProcessInjector {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn command_line(&self, command: &str) -> String {
        if self.prefix.trim().is_empty() {
            command.to_string()
        } else {
            format!("{} {}", self.prefix.trim(), command)
        }
    }
}

#[async_trait]
impl Injector for ProcessInjector {
    async fn inject_and_execute(
        &self,
        cancel: CancellationToken,
        command: String,
        mut stdin: PipeReader,
        mut stdout: PipeWriter,
        mut stderr: BoxWriter,
    ) -> TunnelResult<()> {
        let line = self.command_line(&command);
        debug!(command = %line, "starting helper process");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("start helper process")?;

        let missing = || TunnelError::Transport("helper stdio unavailable".into());
        let mut child_stdin = child.stdin.take().ok_or_else(missing)?;
        let mut child_stdout = child.stdout.take().ok_or_else(missing)?;
        let mut child_stderr = child.stderr.take().ok_or_else(missing)?;

        let feed = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stdin, &mut child_stdin).await;
            let _ = child_stdin.shutdown().await;
        });
        let drain = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_stdout, &mut stdout).await;
            let _ = stdout.shutdown().await;
        });
        let errors = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_stderr, &mut stderr).await;
            let _ = stderr.shutdown().await;
        });

        let status = tokio::select! {
            // the child is killed when dropped
            _ = cancel.cancelled() => {
                feed.abort();
                drain.abort();
                errors.abort();
                return Err(TunnelError::Cancelled);
            }
            status = child.wait() => status?,
        };
        feed.abort();
        let _ = drain.await;
        let _ = errors.await;
        debug!(%status, "helper process exited");

        if status.success() {
            Ok(())
        } else {
            Err(TunnelError::Transport(status.to_string()))
        }
    }
}
