//! Two-party tunnel bootstrap.
//!
//! One task runs the outer transport (a remote process whose stdio carries
//! the secure-shell stream), the other performs the handshake over the same
//! pipes and then runs the handler. The first task to finish decides the
//! outcome; the other is cancelled and aborted, which drops its pipe ends
//! and unblocks anything still waiting on them.

use crate::ssh::{SshClient, SshConnector};
use devtun_core::{pipe, PipeReader, PipeWriter, ResultExt, TunnelResult};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error labels for the two sides of a hop.
#[derive(Debug, Clone, Copy)]
pub struct Labels {
    pub outer: &'static str,
    pub inner: &'static str,
}

/// Run `outer` and `handler` as one hop under a child of `parent`.
///
/// `outer` gets the pipe ends the remote process reads from and writes to.
/// The handler only starts once the handshake over the other ends has
/// succeeded; a failed handshake is labelled `create ssh client`.
pub async fn run_nested<O, OFut, H, HFut>(
    parent: &CancellationToken,
    connector: Arc<dyn SshConnector>,
    outer: O,
    handler: H,
    labels: Labels,
) -> TunnelResult<()>
where
    O: FnOnce(CancellationToken, PipeReader, PipeWriter) -> OFut,
    OFut: Future<Output = TunnelResult<()>> + Send + 'static,
    H: FnOnce(CancellationToken, Arc<dyn SshClient>) -> HFut + Send + 'static,
    HFut: Future<Output = TunnelResult<()>> + Send + 'static,
{
    let cancel = parent.child_token();
    let (remote_stdin, client_writer) = pipe();
    let (client_reader, remote_stdout) = pipe();

    let mut tasks = JoinSet::new();

    let outer = outer(cancel.clone(), remote_stdin, remote_stdout);
    tasks.spawn(async move { outer.await.context(labels.outer) });

    let inner_cancel = cancel.clone();
    tasks.spawn(async move {
        let client = connector
            .connect(client_reader, client_writer)
            .await
            .context("create ssh client")
            .context(labels.inner)?;
        debug!(hop = labels.inner, "ssh handshake complete");
        let result = handler(inner_cancel, client.clone()).await;
        client.close().await;
        result.context(labels.inner)
    });

    let first = tasks.join_next().await;
    cancel.cancel();
    tasks.shutdown().await;

    match first {
        Some(joined) => joined?,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::FakeConnector;
    use crate::ssh::RunOptions;
    use devtun_core::TunnelError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;

    const LABELS: Labels = Labels {
        outer: "connect to server",
        inner: "tunnel to container",
    };

    /// Behaves like a remote helper: runs until its stdin closes.
    async fn helper(
        cancel: CancellationToken,
        mut stdin: PipeReader,
        _stdout: PipeWriter,
    ) -> TunnelResult<()> {
        let mut sink = Vec::new();
        tokio::select! {
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            read = stdin.read_to_end(&mut sink) => read.map(|_| ()).map_err(Into::into),
        }
    }

    #[tokio::test]
    async fn handler_runs_after_handshake() {
        let connector = Arc::new(FakeConnector::draining());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let parent = CancellationToken::new();

        run_nested(
            &parent,
            connector.clone(),
            |cancel, stdin, stdout| helper(cancel, stdin, stdout),
            move |_cancel, client| async move {
                client.run(CancellationToken::new(), RunOptions::new("true")).await?;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            LABELS,
        )
        .await
        .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(connector.commands(), vec!["true"]);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn handler_error_is_labelled() {
        let err = run_nested(
            &CancellationToken::new(),
            Arc::new(FakeConnector::draining()),
            |cancel, stdin, stdout| helper(cancel, stdin, stdout),
            |_cancel, _client| async { Err(TunnelError::Protocol("bad".into())) },
            LABELS,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "tunnel to container: protocol error: bad");
    }

    #[tokio::test]
    async fn handshake_failure_is_labelled() {
        let err = run_nested(
            &CancellationToken::new(),
            Arc::new(FakeConnector::failing()),
            |cancel, stdin, stdout| helper(cancel, stdin, stdout),
            |_cancel, _client| async { Ok(()) },
            LABELS,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "tunnel to container: create ssh client: transport error: handshake failed"
        );
    }

    #[tokio::test]
    async fn outer_failure_cancels_handler() {
        let err = run_nested(
            &CancellationToken::new(),
            Arc::new(FakeConnector::draining()),
            |_cancel, _stdin, _stdout| async {
                Err(TunnelError::Transport("helper exited".into()))
            },
            |cancel, _client| async move {
                cancel.cancelled().await;
                Ok(())
            },
            LABELS,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "connect to server: transport error: helper exited");
        assert_eq!(err.code(), devtun_core::Code::Transport);
    }

    #[tokio::test]
    async fn parent_cancel_unwinds_both_sides() {
        let parent = CancellationToken::new();
        let trigger = parent.clone();
        let result = run_nested(
            &parent,
            Arc::new(FakeConnector::draining()),
            |cancel, stdin, stdout| helper(cancel, stdin, stdout),
            move |cancel, _client| async move {
                trigger.cancel();
                cancel.cancelled().await;
                Err(TunnelError::Cancelled)
            },
            LABELS,
        )
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
