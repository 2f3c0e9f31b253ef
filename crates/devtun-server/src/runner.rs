//! Runner-side tunnel server: answers only what it must.

use crate::credentials::{signature_message, CredentialBroker, CredentialPolicy, LocalCredentialBroker};
use crate::host::emit_remote_log;
use crate::serve::{CapturesResult, ResultSlot};
use async_trait::async_trait;
use devtun_core::credentials::{
    DockerCredentialsRequest, GitCredentials, GitSshSignatureRequest, GitUser,
};
use devtun_core::{
    ChunkStream, LogMessage, Message, MountRequest, PortRequest, ResultExt, Tunnel, TunnelResult,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// Credentials only when the policy allows them; auxiliary calls succeed
/// with empty payloads and streams are empty.
pub struct RunnerTunnelServer {
    policy: CredentialPolicy,
    broker: Arc<dyn CredentialBroker>,
    result: ResultSlot,
}

impl RunnerTunnelServer {
    pub fn new(policy: CredentialPolicy) -> Self {
        Self {
            policy,
            broker: Arc::new(LocalCredentialBroker::default()),
            result: ResultSlot::default(),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = broker;
        self
    }
}

impl CapturesResult for RunnerTunnelServer {
    fn result_slot(&self) -> &ResultSlot {
        &self.result
    }
}

fn empty_stream() -> ChunkStream {
    futures::stream::empty().boxed()
}

#[async_trait]
impl Tunnel for RunnerTunnelServer {
    async fn ping(&self) -> TunnelResult<()> {
        debug!("received ping");
        Ok(())
    }

    async fn log(&self, message: LogMessage) -> TunnelResult<()> {
        emit_remote_log(&message);
        Ok(())
    }

    async fn forward_port(&self, _request: PortRequest) -> TunnelResult<()> {
        Ok(())
    }

    async fn stop_forward_port(&self, _request: PortRequest) -> TunnelResult<()> {
        Ok(())
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
        let creds: GitCredentials = request
            .decode()
            .map_err(|e| e.context("decode git credentials request"))?;
        let response = self
            .broker
            .git_credentials(&creds)
            .await
            .context("get git response")?;
        Message::encode(&response)
    }

    async fn git_user(&self) -> TunnelResult<Message> {
        Message::encode(&GitUser::default())
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

    async fn gpg_public_keys(&self) -> TunnelResult<Message> {
        Ok(Message::default())
    }

    async fn send_result(&self, result: Message) -> TunnelResult<()> {
        self.result.store(&result.message)
    }

    async fn stream_workspace(&self) -> TunnelResult<ChunkStream> {
        Ok(empty_stream())
    }

    async fn stream_git_clone(&self) -> TunnelResult<ChunkStream> {
        Ok(empty_stream())
    }

    async fn stream_mount(&self, _request: MountRequest) -> TunnelResult<ChunkStream> {
        Ok(empty_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devtun_core::Code;

    #[tokio::test]
    async fn denies_credentials_by_default() {
        let server = RunnerTunnelServer::new(CredentialPolicy::default());
        let err = server
            .docker_credentials(Message::new(r#"{"serverURL":"registry.example.com"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        let err = server.git_credentials(Message::new("{}")).await.unwrap_err();
        assert_eq!(err.to_string(), "git credentials forbidden");
        let err = server
            .git_ssh_signature(Message::new(r#"{"Content":"x","KeyPath":"/k"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn auxiliary_calls_are_empty_successes() {
        let server = RunnerTunnelServer::new(CredentialPolicy::default());
        server.ping().await.unwrap();
        server.forward_port(PortRequest::new("8080")).await.unwrap();
        server.stop_forward_port(PortRequest::new("8080")).await.unwrap();
        let user: GitUser = server.git_user().await.unwrap().decode().unwrap();
        assert_eq!(user, GitUser::default());
        assert_eq!(server.gpg_public_keys().await.unwrap(), Message::default());
        assert_eq!(server.stream_workspace().await.unwrap().count().await, 0);
        assert_eq!(
            server
                .stream_mount(MountRequest { mount: "type=bind,src=/a,dst=/b".into() })
                .await
                .unwrap()
                .count()
                .await,
            0
        );
    }
}
