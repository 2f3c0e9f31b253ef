//! Host-side tunnel server: the full implementation, bound to one workspace.

use crate::archive;
use crate::credentials::{
    gpg_keys_message, signature_message, CredentialBroker, CredentialPolicy, GitOverride,
    LocalCredentialBroker,
};
use crate::serve::{CapturesResult, ResultSlot};
use crate::workspace::{Mount, Workspace};
use async_trait::async_trait;
use devtun_core::credentials::{DockerCredentialsRequest, GitCredentials, GitSshSignatureRequest};
use devtun_core::{
    ChunkStream, Forwarder, LogLevel, LogMessage, Message, MountRequest, PortRequest, ResultExt,
    Tunnel, TunnelError, TunnelResult,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Re-emit a log line received from the peer on the local subscriber.
pub(crate) fn emit_remote_log(message: &LogMessage) {
    let text = message.message.trim();
    match message.log_level {
        LogLevel::Debug => debug!(target: "devtun::remote", "{text}"),
        LogLevel::Info => info!(target: "devtun::remote", "{text}"),
        LogLevel::Warning => warn!(target: "devtun::remote", "{text}"),
        LogLevel::Error => error!(target: "devtun::remote", "{text}"),
        LogLevel::Done => info!(target: "devtun::remote", done = true, "{text}"),
    }
}

pub(crate) fn no_forwarder() -> TunnelError {
    TunnelError::Unavailable("cannot forward ports".into())
}

/// The host variant. Configure with the `with_*` builders, then serve it
/// with [`crate::run_with_result`] or [`crate::serve_tunnel`].
pub struct HostTunnelServer {
    policy: CredentialPolicy,
    forwarder: Option<Arc<dyn Forwarder>>,
    workspace: Option<Workspace>,
    mounts: Vec<Mount>,
    git_override: Option<GitOverride>,
    broker: Arc<dyn CredentialBroker>,
    result: ResultSlot,
}

impl Default for HostTunnelServer {
    fn default() -> Self {
        Self::new(CredentialPolicy::default())
    }
}

impl HostTunnelServer {
    pub fn new(policy: CredentialPolicy) -> Self {
        Self {
            policy,
            forwarder: None,
            workspace: None,
            mounts: Vec::new(),
            git_override: None,
            broker: Arc::new(LocalCredentialBroker::default()),
            result: ResultSlot::default(),
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_workspace(mut self, workspace: Workspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Mounts the peer may download with `StreamMount`.
    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_git_override(mut self, git_override: Option<GitOverride>) -> Self {
        self.git_override = git_override;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = broker;
        self
    }

    fn forwarder(&self) -> TunnelResult<&Arc<dyn Forwarder>> {
        self.forwarder.as_ref().ok_or_else(no_forwarder)
    }

    /// Point the request at the workspace repository when the hosts match,
    /// so credential helpers can pick per-repository secrets.
    fn scope_to_repository(&self, creds: &mut GitCredentials) {
        let Some(git) = self.workspace.as_ref().and_then(|w| w.git.as_ref()) else {
            return;
        };
        if let Some((host, path)) = git.host_and_path() {
            if host == creds.host {
                creds.path = path;
            }
        }
    }
}

impl CapturesResult for HostTunnelServer {
    fn result_slot(&self) -> &ResultSlot {
        &self.result
    }
}

#[async_trait]
impl Tunnel for HostTunnelServer {
    async fn ping(&self) -> TunnelResult<()> {
        debug!("received ping from agent");
        Ok(())
    }

    async fn log(&self, message: LogMessage) -> TunnelResult<()> {
        emit_remote_log(&message);
        Ok(())
    }

    async fn forward_port(&self, request: PortRequest) -> TunnelResult<()> {
        self.forwarder()?
            .forward(&request.port)
            .await
            .context(format!("error forwarding port {}", request.port))
    }

    async fn stop_forward_port(&self, request: PortRequest) -> TunnelResult<()> {
        self.forwarder()?
            .stop_forward(&request.port)
            .await
            .context(format!("error stop forwarding port {}", request.port))
    }

    async fn docker_credentials(&self, request: Message) -> TunnelResult<Message> {
        self.policy.check_docker()?;
        let request: DockerCredentialsRequest = request.decode()?;
        if request.server_url.is_empty() {
            Message::encode(&self.broker.docker_credential_list().await?)
        } else {
            Message::encode(&self.broker.docker_credentials(&request.server_url).await?)
        }
    }

    async fn git_credentials(&self, request: Message) -> TunnelResult<Message> {
        self.policy.check_git()?;
        if let Some(over) = &self.git_override {
            return over.answer(&request);
        }

        let mut creds: GitCredentials = request
            .decode()
            .map_err(|e| e.context("decode git credentials request"))?;
        self.scope_to_repository(&mut creds);
        let response = self
            .broker
            .git_credentials(&creds)
            .await
            .context("get git response")?;
        Message::encode(&response)
    }

    async fn git_user(&self) -> TunnelResult<Message> {
        Message::encode(&self.broker.git_user().await?)
    }

    async fn git_ssh_signature(&self, request: Message) -> TunnelResult<Message> {
        self.policy.check_git()?;
        let request: GitSshSignatureRequest = request
            .decode()
            .map_err(|e| e.context("decode git ssh signature request"))?;
        let armored = self
            .broker
            .git_ssh_signature(&request)
            .await
            .context("get git ssh signature")?;
        signature_message(&armored)
    }

    // public keys, so no policy gate
    async fn gpg_public_keys(&self) -> TunnelResult<Message> {
        let armored = self
            .broker
            .gpg_public_keys()
            .await
            .context("get gpg public keys")?;
        Ok(gpg_keys_message(&armored))
    }

    async fn send_result(&self, result: Message) -> TunnelResult<()> {
        self.result.store(&result.message)
    }

    async fn stream_workspace(&self) -> TunnelResult<ChunkStream> {
        debug!("streaming workspace");
        self.workspace
            .as_ref()
            .ok_or_else(|| TunnelError::Unavailable("no workspace configured".into()))?
            .stream_local()
    }

    async fn stream_git_clone(&self) -> TunnelResult<ChunkStream> {
        debug!("cloning and streaming workspace");
        self.workspace
            .as_ref()
            .ok_or_else(|| TunnelError::Unavailable("no workspace configured".into()))?
            .stream_git_clone()
            .await
    }

    async fn stream_mount(&self, request: MountRequest) -> TunnelResult<ChunkStream> {
        let mount = self
            .mounts
            .iter()
            .find(|m| m.to_string() == request.mount)
            .ok_or_else(|| {
                TunnelError::PermissionDenied(format!(
                    "mount {} is not allowed to download",
                    request.mount
                ))
            })?;
        let rules = self
            .workspace
            .as_ref()
            .map(Workspace::ignore_rules)
            .unwrap_or_default();
        Ok(archive::archive_dir(mount.source.clone().into(), rules))
    }
}
