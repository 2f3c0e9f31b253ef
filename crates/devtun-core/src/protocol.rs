//! The tunnel protocol: one capability set shared by the CLI, host agent,
//! and container agent, plus the adapter that serves it over [`crate::rpc`].

use crate::codec::{from_value, to_value};
use crate::error::{TunnelError, TunnelResult};
use crate::messages::{Chunk, Empty, LogMessage, Message, MountRequest, PortRequest};
use crate::rpc::{Dispatch, Reply};
use async_trait::async_trait;
use ciborium::Value;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;

/// Method names on the wire.
pub mod method {
    pub const PING: &str = "Ping";
    pub const LOG: &str = "Log";
    pub const FORWARD_PORT: &str = "ForwardPort";
    pub const STOP_FORWARD_PORT: &str = "StopForwardPort";
    pub const DOCKER_CREDENTIALS: &str = "DockerCredentials";
    pub const GIT_CREDENTIALS: &str = "GitCredentials";
    pub const GIT_USER: &str = "GitUser";
    pub const GIT_SSH_SIGNATURE: &str = "GitSSHSignature";
    pub const GPG_PUBLIC_KEYS: &str = "GPGPublicKeys";
    pub const SEND_RESULT: &str = "SendResult";
    pub const STREAM_WORKSPACE: &str = "StreamWorkspace";
    pub const STREAM_GIT_CLONE: &str = "StreamGitClone";
    pub const STREAM_MOUNT: &str = "StreamMount";
}

pub type ChunkStream = BoxStream<'static, TunnelResult<Chunk>>;

/// Everything a tunnel peer can ask of the other side.
///
/// Implemented by the server variants and by the client, so a relay can
/// hold either behind `Arc<dyn Tunnel>`.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn ping(&self) -> TunnelResult<()>;

    async fn log(&self, message: LogMessage) -> TunnelResult<()>;

    async fn forward_port(&self, request: PortRequest) -> TunnelResult<()>;

    async fn stop_forward_port(&self, request: PortRequest) -> TunnelResult<()>;

    /// JSON `DockerCredentialsRequest` in, credentials or list out.
    async fn docker_credentials(&self, request: Message) -> TunnelResult<Message>;

    /// JSON `GitCredentials` in and out.
    async fn git_credentials(&self, request: Message) -> TunnelResult<Message>;

    async fn git_user(&self) -> TunnelResult<Message>;

    /// JSON `GitSshSignatureRequest` in, `GitSshSignatureResponse` out.
    async fn git_ssh_signature(&self, request: Message) -> TunnelResult<Message>;

    /// Base64 of the ASCII-armored public keys.
    async fn gpg_public_keys(&self) -> TunnelResult<Message>;

    /// JSON result document.
    async fn send_result(&self, result: Message) -> TunnelResult<()>;

    async fn stream_workspace(&self) -> TunnelResult<ChunkStream>;

    async fn stream_git_clone(&self) -> TunnelResult<ChunkStream>;

    async fn stream_mount(&self, request: MountRequest) -> TunnelResult<ChunkStream>;
}

/// Serves a [`Tunnel`] implementation through an [`crate::rpc::RpcServer`].
pub struct TunnelService<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: Tunnel + ?Sized> TunnelService<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

fn unary<T: serde::Serialize>(value: &T) -> TunnelResult<Reply> {
    Ok(Reply::Unary(to_value(value)?))
}

fn chunks(stream: ChunkStream) -> Reply {
    Reply::Stream(
        stream
            .map(|chunk| chunk.and_then(|c| to_value(&c)))
            .boxed(),
    )
}

#[async_trait]
impl<T: Tunnel + ?Sized + 'static> Dispatch for TunnelService<T> {
    async fn dispatch(&self, name: &str, body: Value) -> TunnelResult<Reply> {
        let t = &self.inner;
        match name {
            method::PING => {
                t.ping().await?;
                unary(&Empty {})
            }
            method::LOG => {
                t.log(from_value(&body)?).await?;
                unary(&Empty {})
            }
            method::FORWARD_PORT => {
                t.forward_port(from_value(&body)?).await?;
                unary(&Empty {})
            }
            method::STOP_FORWARD_PORT => {
                t.stop_forward_port(from_value(&body)?).await?;
                unary(&Empty {})
            }
            method::DOCKER_CREDENTIALS => unary(&t.docker_credentials(from_value(&body)?).await?),
            method::GIT_CREDENTIALS => unary(&t.git_credentials(from_value(&body)?).await?),
            method::GIT_USER => unary(&t.git_user().await?),
            method::GIT_SSH_SIGNATURE => unary(&t.git_ssh_signature(from_value(&body)?).await?),
            method::GPG_PUBLIC_KEYS => unary(&t.gpg_public_keys().await?),
            method::SEND_RESULT => {
                t.send_result(from_value(&body)?).await?;
                unary(&Empty {})
            }
            method::STREAM_WORKSPACE => Ok(chunks(t.stream_workspace().await?)),
            method::STREAM_GIT_CLONE => Ok(chunks(t.stream_git_clone().await?)),
            method::STREAM_MOUNT => Ok(chunks(t.stream_mount(from_value(&body)?).await?)),
            other => Err(TunnelError::Unimplemented(format!("unknown method {other}"))),
        }
    }
}
