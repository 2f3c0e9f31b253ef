//! [`SshConnector`] backed by `russh`.
//!
//! The peer is a helper speaking the server role over stdio, so there is no
//! host key to pin and authentication is `none`.

use super::{agent_socket, RunOptions, SshClient, SshConnector};
use async_trait::async_trait;
use devtun_core::transport::Connection;
use devtun_core::{PipeReader, PipeWriter, ResultExt, StdioStream, TunnelError, TunnelResult};
use russh::client::{self, Handle, Msg, Session};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn transport(e: russh::Error) -> TunnelError {
    TunnelError::Transport(e.to_string())
}

/// Client-side callbacks.
struct ClientHandler {
    agent_socket: Option<String>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(socket) = self.agent_socket.clone() else {
            debug!("agent channel opened without a local agent");
            return Ok(());
        };
        tokio::spawn(async move {
            let mut local = match tokio::net::UnixStream::connect(&socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(socket = %socket, error = %e, "failed to reach ssh agent");
                    return;
                }
            };
            let mut remote = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                debug!(error = %e, "agent channel closed");
            }
        });
        Ok(())
    }
}

/// Connects as `user` with `none` authentication.
pub struct RusshConnector {
    user: String,
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            config: Arc::new(client::Config::default()),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(std::env::var("USER").unwrap_or_else(|_| "root".to_string()))
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(
        &self,
        reader: PipeReader,
        writer: PipeWriter,
    ) -> TunnelResult<Arc<dyn SshClient>> {
        let stream = StdioStream::new(reader, writer, false);
        let handler = ClientHandler {
            agent_socket: agent_socket(),
        };
        let mut handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(transport)?;
        let auth = handle
            .authenticate_none(self.user.clone())
            .await
            .map_err(transport)?;
        if !auth.success() {
            return Err(TunnelError::PermissionDenied(format!(
                "ssh authentication rejected for {}",
                self.user
            )));
        }
        debug!(user = %self.user, "ssh client connected");
        Ok(Arc::new(RusshClient { handle }))
    }
}

pub struct RusshClient {
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl SshClient for RusshClient {
    async fn run(&self, cancel: CancellationToken, options: RunOptions) -> TunnelResult<()> {
        let RunOptions {
            command,
            env,
            stdin,
            stdout,
            stderr,
            forward_agent,
        } = options;

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(transport)
            .context("create ssh session")?;
        if forward_agent {
            channel
                .agent_forward(true)
                .await
                .map_err(transport)
                .context("forward agent")?;
        }
        for (name, value) in env {
            channel
                .set_env(true, name, value)
                .await
                .map_err(transport)
                .context("set environment")?;
        }
        debug!(command = %command, "running remote command");
        channel.exec(true, command).await.map_err(transport)?;

        let mut writer = Box::pin(channel.make_writer());
        let feed = match stdin {
            Some(mut stdin) => Some(tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut stdin, &mut writer).await {
                    debug!(error = %e, "stdin copy ended");
                }
                let _ = writer.shutdown().await;
            })),
            None => {
                channel.eof().await.map_err(transport)?;
                None
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            outcome = pump(&mut channel, stdout, stderr) => outcome,
        };
        if cancel.is_cancelled() {
            let _ = channel.close().await;
        }
        if let Some(feed) = feed {
            feed.abort();
        }
        outcome
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> TunnelResult<Box<dyn Connection>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(transport)?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "ssh disconnect failed");
        }
    }
}

/// Copy channel output until the channel closes, then report how the
/// command ended.
async fn pump(
    channel: &mut Channel<Msg>,
    mut stdout: Option<super::BoxWriter>,
    mut stderr: Option<super::BoxWriter>,
) -> TunnelResult<()> {
    let mut outcome = Ok(());
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => {
                if let Some(out) = stdout.as_mut() {
                    out.write_all(data).await?;
                }
            }
            ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                if let Some(err) = stderr.as_mut() {
                    err.write_all(data).await?;
                }
            }
            ChannelMsg::ExitStatus { exit_status } if exit_status != 0 => {
                outcome = Err(TunnelError::Transport(format!(
                    "process exited with status {exit_status}"
                )));
            }
            ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            } => {
                outcome = Err(TunnelError::Transport(format!(
                    "signal: {signal_name:?} {error_message}"
                )));
            }
            _ => {}
        }
    }
    for writer in [stdout.as_mut(), stderr.as_mut()].into_iter().flatten() {
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
    }
    outcome
}
