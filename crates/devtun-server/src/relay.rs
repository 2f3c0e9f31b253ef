//! Relay tunnel server: passes calls through to an upstream peer.
//!
//! Sits in the middle hop, where the container talks to us and we talk to
//! the orchestrator. Everything is forwarded verbatim except:
//!
//! * credential calls are checked against the local policy first, and git
//!   credentials are answered locally when a token override is configured;
//! * `SendResult` is parsed and kept here as well as forwarded;
//! * streams are re-buffered through [`crate::archive::rechunk`].

use crate::archive::rechunk;
use crate::credentials::{CredentialPolicy, GitOverride};
use crate::serve::{CapturesResult, ResultSlot};
use async_trait::async_trait;
use devtun_core::{
    ChunkStream, LogMessage, Message, MountRequest, PortRequest, Tunnel, TunnelResult,
};
use std::sync::Arc;
use tracing::debug;

pub struct RelayTunnelServer {
    upstream: Arc<dyn Tunnel>,
    policy: CredentialPolicy,
    git_override: Option<GitOverride>,
    result: ResultSlot,
}

impl RelayTunnelServer {
    pub fn new(upstream: Arc<dyn Tunnel>, policy: CredentialPolicy) -> Self {
        Self {
            upstream,
            policy,
            git_override: None,
            result: ResultSlot::default(),
        }
    }

    pub fn with_git_override(mut self, git_override: Option<GitOverride>) -> Self {
        self.git_override = git_override;
        self
    }
}

impl CapturesResult for RelayTunnelServer {
    fn result_slot(&self) -> &ResultSlot {
        &self.result
    }
}

#[async_trait]
impl Tunnel for RelayTunnelServer {
    async fn ping(&self) -> TunnelResult<()> {
        self.upstream.ping().await
    }

    async fn log(&self, message: LogMessage) -> TunnelResult<()> {
        self.upstream.log(message).await
    }

    async fn forward_port(&self, request: PortRequest) -> TunnelResult<()> {
        self.upstream.forward_port(request).await
    }

    async fn stop_forward_port(&self, request: PortRequest) -> TunnelResult<()> {
        self.upstream.stop_forward_port(request).await
    }

    async fn docker_credentials(&self, request: Message) -> TunnelResult<Message> {
        self.policy.check_docker()?;
        self.upstream.docker_credentials(request).await
    }

    async fn git_credentials(&self, request: Message) -> TunnelResult<Message> {
        self.policy.check_git()?;
        match &self.git_override {
            Some(over) => over.answer(&request),
            None => self.upstream.git_credentials(request).await,
        }
    }

    async fn git_user(&self) -> TunnelResult<Message> {
        self.upstream.git_user().await
    }

    async fn git_ssh_signature(&self, request: Message) -> TunnelResult<Message> {
        self.policy.check_git()?;
        self.upstream.git_ssh_signature(request).await
    }

    async fn gpg_public_keys(&self) -> TunnelResult<Message> {
        self.upstream.gpg_public_keys().await
    }

    async fn send_result(&self, result: Message) -> TunnelResult<()> {
        self.result.store(&result.message)?;
        self.upstream.send_result(result).await
    }

    async fn stream_workspace(&self) -> TunnelResult<ChunkStream> {
        debug!("relaying workspace stream");
        Ok(rechunk(self.upstream.stream_workspace().await?))
    }

    async fn stream_git_clone(&self) -> TunnelResult<ChunkStream> {
        debug!("relaying git clone stream");
        Ok(rechunk(self.upstream.stream_git_clone().await?))
    }

    async fn stream_mount(&self, request: MountRequest) -> TunnelResult<ChunkStream> {
        debug!(mount = %request.mount, "relaying mount stream");
        Ok(rechunk(self.upstream.stream_mount(request).await?))
    }
}
