//! In-memory stand-ins for the secure-shell capability.

use super::{RunOptions, SshClient, SshConnector};
use async_trait::async_trait;
use devtun_core::transport::Connection;
use devtun_core::{PipeReader, PipeWriter, TunnelError, TunnelResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

pub(crate) type Script =
    Arc<dyn Fn(CancellationToken, RunOptions) -> BoxFuture<'static, TunnelResult<()>> + Send + Sync>;

/// Reads stdin until EOF or cancellation, like a long-running command.
pub(crate) async fn drain(cancel: CancellationToken, options: RunOptions) -> TunnelResult<()> {
    let Some(mut stdin) = options.stdin else {
        return Ok(());
    };
    let mut sink = Vec::new();
    tokio::select! {
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        read = stdin.read_to_end(&mut sink) => read.map(|_| ()).map_err(Into::into),
    }
}

pub(crate) struct FakeConnector {
    pub script: Script,
    pub commands: Arc<Mutex<Vec<String>>>,
    pub fail: bool,
}

impl FakeConnector {
    /// Every `run` on a connected client is answered by `script`.
    pub fn new<F, Fut>(script: F) -> Self
    where
        F: Fn(CancellationToken, RunOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TunnelResult<()>> + Send + 'static,
    {
        Self {
            script: Arc::new(move |cancel: CancellationToken, options: RunOptions| {
                script(cancel, options).boxed()
            }),
            commands: Arc::default(),
            fail: false,
        }
    }

    pub fn draining() -> Self {
        Self::new(drain)
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::draining()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn connect(
        &self,
        reader: PipeReader,
        writer: PipeWriter,
    ) -> TunnelResult<Arc<dyn SshClient>> {
        if self.fail {
            return Err(TunnelError::Transport("handshake failed".into()));
        }
        Ok(Arc::new(FakeClient {
            script: self.script.clone(),
            commands: self.commands.clone(),
            pipes: Mutex::new(Some((reader, writer))),
        }))
    }
}

/// Holds the transport pipes until closed, so the far end sees EOF then.
pub(crate) struct FakeClient {
    script: Script,
    commands: Arc<Mutex<Vec<String>>>,
    pipes: Mutex<Option<(PipeReader, PipeWriter)>>,
}

#[async_trait]
impl SshClient for FakeClient {
    async fn run(&self, cancel: CancellationToken, options: RunOptions) -> TunnelResult<()> {
        self.commands.lock().unwrap().push(options.command.clone());
        (self.script)(cancel, options).await
    }

    async fn open_direct_tcpip(&self, _host: &str, _port: u16) -> TunnelResult<Box<dyn Connection>> {
        let (near, mut far) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(&mut far);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        Ok(Box::new(near))
    }

    async fn close(&self) {
        self.pipes.lock().unwrap().take();
    }
}
