//! Secure-shell capability used by the orchestrator.
//!
//! The orchestration code only sees [`SshConnector`] and [`SshClient`]; the
//! russh-backed implementation lives in [`client`].

pub mod client;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use devtun_core::transport::Connection;
use devtun_core::{PipeReader, PipeWriter, TunnelResult};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use self::client::{RusshClient, RusshConnector};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One remote command invocation.
///
/// Missing stdin means the remote side sees EOF right away; missing
/// stdout/stderr discard the output.
pub struct RunOptions {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub stdin: Option<BoxReader>,
    pub stdout: Option<BoxWriter>,
    pub stderr: Option<BoxWriter>,
    pub forward_agent: bool,
}

impl RunOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            forward_agent: false,
        }
    }

    pub fn stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    pub fn stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    pub fn stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    pub fn env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn forward_agent(mut self, forward: bool) -> Self {
        self.forward_agent = forward;
        self
    }
}

/// An established secure-shell client.
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Run one command in a fresh session and wait for it to exit.
    ///
    /// A non-zero exit status is an error; a termination signal is an error
    /// whose message contains `signal: <NAME>`.
    async fn run(&self, cancel: CancellationToken, options: RunOptions) -> TunnelResult<()>;

    /// Open a `direct-tcpip` channel to `host:port` as seen from the server.
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> TunnelResult<Box<dyn Connection>>;

    async fn close(&self);
}

/// Performs the client handshake over an already-connected pipe pair.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        reader: PipeReader,
        writer: PipeWriter,
    ) -> TunnelResult<Arc<dyn SshClient>>;
}

/// Path of the local agent socket, when one is configured.
pub fn agent_socket() -> Option<String> {
    std::env::var("SSH_AUTH_SOCK")
        .ok()
        .filter(|path| !path.is_empty())
}
