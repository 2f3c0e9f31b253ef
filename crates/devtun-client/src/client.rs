//! The tunnel client.
//!
//! `TunnelClient` speaks the tunnel protocol to a server on the other end of
//! a pipe pair. It implements [`Tunnel`] itself, so a relay server can hold
//! it as its upstream.

use async_trait::async_trait;
use devtun_core::credentials::{
    DockerCredentialsRequest, GitCredentials, GitSshSignatureRequest, GitSshSignatureResponse,
    GitUser,
};
use devtun_core::protocol::method;
use devtun_core::rpc::RpcClient;
use devtun_core::{
    ChunkStream, DevcontainerResult, Empty, LogLevel, LogMessage, Message, MountRequest,
    PortRequest, StdioStream, Tunnel, TunnelResult,
};
use tokio::io::{AsyncRead, AsyncWrite};

pub struct TunnelClient {
    rpc: RpcClient,
}

impl TunnelClient {
    /// Connect over a reader/writer pair. With `exit_on_close` the process
    /// exits once the connection closes; use it only for this process's
    /// own stdio.
    pub fn new<R, W>(reader: R, writer: W, exit_on_close: bool) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            rpc: RpcClient::new(StdioStream::new(reader, writer, exit_on_close)),
        }
    }

    /// Connect over this process's stdin/stdout.
    pub fn from_stdio() -> Self {
        Self {
            rpc: RpcClient::new(StdioStream::from_process()),
        }
    }

    /// Resolves once the server side has gone away.
    pub async fn closed(&self) {
        self.rpc.closed().await
    }

    pub async fn log_line(&self, level: LogLevel, message: impl Into<String>) -> TunnelResult<()> {
        self.log(LogMessage {
            log_level: level,
            message: message.into(),
        })
        .await
    }

    /// Typed docker credential lookup. Returns the raw JSON text so callers
    /// can choose between the single-set and list shapes.
    pub async fn docker_credentials_for(&self, server_url: &str) -> TunnelResult<Message> {
        self.docker_credentials(Message::encode(&DockerCredentialsRequest {
            server_url: server_url.to_string(),
        })?)
        .await
    }

    pub async fn git_credentials_for(&self, request: &GitCredentials) -> TunnelResult<GitCredentials> {
        self.git_credentials(Message::encode(request)?).await?.decode()
    }

    pub async fn git_user_typed(&self) -> TunnelResult<GitUser> {
        self.git_user().await?.decode()
    }

    pub async fn git_ssh_signature_for(
        &self,
        request: &GitSshSignatureRequest,
    ) -> TunnelResult<GitSshSignatureResponse> {
        self.git_ssh_signature(Message::encode(request)?).await?.decode()
    }

    pub async fn send_result_typed(&self, result: &DevcontainerResult) -> TunnelResult<()> {
        self.send_result(Message::encode(result)?).await
    }
}

#[async_trait]
impl Tunnel for TunnelClient {
    async fn ping(&self) -> TunnelResult<()> {
        let _: Empty = self.rpc.call(method::PING, &Empty {}).await?;
        Ok(())
    }

    async fn log(&self, message: LogMessage) -> TunnelResult<()> {
        let _: Empty = self.rpc.call(method::LOG, &message).await?;
        Ok(())
    }

    async fn forward_port(&self, request: PortRequest) -> TunnelResult<()> {
        let _: Empty = self.rpc.call(method::FORWARD_PORT, &request).await?;
        Ok(())
    }

    async fn stop_forward_port(&self, request: PortRequest) -> TunnelResult<()> {
        let _: Empty = self.rpc.call(method::STOP_FORWARD_PORT, &request).await?;
        Ok(())
    }

    async fn docker_credentials(&self, request: Message) -> TunnelResult<Message> {
        self.rpc.call(method::DOCKER_CREDENTIALS, &request).await
    }

    async fn git_credentials(&self, request: Message) -> TunnelResult<Message> {
        self.rpc.call(method::GIT_CREDENTIALS, &request).await
    }

    async fn git_user(&self) -> TunnelResult<Message> {
        self.rpc.call(method::GIT_USER, &Empty {}).await
    }

    async fn git_ssh_signature(&self, request: Message) -> TunnelResult<Message> {
        self.rpc.call(method::GIT_SSH_SIGNATURE, &request).await
    }

    async fn gpg_public_keys(&self) -> TunnelResult<Message> {
        self.rpc.call(method::GPG_PUBLIC_KEYS, &Empty {}).await
    }

    async fn send_result(&self, result: Message) -> TunnelResult<()> {
        let _: Empty = self.rpc.call(method::SEND_RESULT, &result).await?;
        Ok(())
    }

    async fn stream_workspace(&self) -> TunnelResult<ChunkStream> {
        self.rpc.call_stream(method::STREAM_WORKSPACE, &Empty {}).await
    }

    async fn stream_git_clone(&self) -> TunnelResult<ChunkStream> {
        self.rpc.call_stream(method::STREAM_GIT_CLONE, &Empty {}).await
    }

    async fn stream_mount(&self, request: MountRequest) -> TunnelResult<ChunkStream> {
        self.rpc.call_stream(method::STREAM_MOUNT, &request).await
    }
}
