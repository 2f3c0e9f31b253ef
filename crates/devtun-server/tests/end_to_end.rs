//! Client ↔ server sessions over in-memory pipes.

use async_trait::async_trait;
use devtun_client::{chunk_reader, TunnelClient};
use devtun_core::credentials::{
    DockerCredentialList, DockerCredentials, GitCredentials, GitSshSignatureRequest, GitUser,
};
use devtun_core::{
    pipe, Code, DevcontainerResult, Forwarder, Message, PortRequest, Tunnel, TunnelError,
    TunnelResult,
};
use devtun_server::{
    run_with_result, CapturesResult, CredentialBroker, CredentialPolicy, HostTunnelServer,
    RelayTunnelServer, Workspace,
};
use std::io::Read;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct FakeStore;

#[async_trait]
impl CredentialBroker for FakeStore {
    async fn docker_credentials(&self, _server_url: &str) -> TunnelResult<DockerCredentials> {
        Ok(DockerCredentials {
            username: "u".into(),
            password: "p".into(),
            ..Default::default()
        })
    }

    async fn docker_credential_list(&self) -> TunnelResult<DockerCredentialList> {
        Ok(DockerCredentialList::default())
    }

    async fn git_credentials(&self, request: &GitCredentials) -> TunnelResult<GitCredentials> {
        Ok(request.clone())
    }

    async fn git_user(&self) -> TunnelResult<GitUser> {
        Ok(GitUser {
            name: "Dev".into(),
            email: "dev@example.com".into(),
        })
    }

    async fn git_ssh_signature(&self, request: &GitSshSignatureRequest) -> TunnelResult<String> {
        Ok(format!("signed {} with {}", request.content, request.key_path))
    }

    async fn gpg_public_keys(&self) -> TunnelResult<String> {
        Ok("-----BEGIN PGP PUBLIC KEY BLOCK-----".into())
    }
}

#[derive(Default)]
struct RecordingForwarder(Mutex<Vec<String>>);

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(&self, port: &str) -> TunnelResult<()> {
        self.0.lock().unwrap().push(format!("forward {port}"));
        Ok(())
    }

    async fn stop_forward(&self, port: &str) -> TunnelResult<()> {
        self.0.lock().unwrap().push(format!("stop {port}"));
        Ok(())
    }
}

/// Serve `server` on one end of a pipe pair and connect a client to the other.
fn connect<T>(
    server: Arc<T>,
    cancel: &CancellationToken,
) -> (TunnelClient, JoinHandle<TunnelResult<Option<DevcontainerResult>>>)
where
    T: Tunnel + CapturesResult + 'static,
{
    let (client_reader, server_writer) = pipe();
    let (server_reader, client_writer) = pipe();
    let cancel = cancel.clone();
    let task = tokio::spawn(async move {
        run_with_result(&cancel, server_reader, server_writer, server).await
    });
    (TunnelClient::new(client_reader, client_writer, false), task)
}

fn host(policy: CredentialPolicy) -> Arc<HostTunnelServer> {
    Arc::new(HostTunnelServer::new(policy).with_broker(Arc::new(FakeStore)))
}

#[tokio::test]
async fn ping_and_docker_policy() {
    let cancel = CancellationToken::new();

    let (client, _task) = connect(host(CredentialPolicy::new(false, false)), &cancel);
    client.ping().await.unwrap();
    let err = client
        .docker_credentials_for("registry.example.com")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert!(err.to_string().contains("forbidden"));

    let (client, _task) = connect(host(CredentialPolicy::new(false, true)), &cancel);
    let response = client
        .docker_credentials_for("registry.example.com")
        .await
        .unwrap();
    assert_eq!(response.message, r#"{"Username":"u","Password":"p"}"#);
    let parsed: serde_json::Value = serde_json::from_str(&response.message).unwrap();
    assert_eq!(parsed, serde_json::json!({"Username": "u", "Password": "p"}));

    cancel.cancel();
}

#[tokio::test]
async fn git_credentials_gated_but_git_user_allowed() {
    let cancel = CancellationToken::new();
    let (client, _task) = connect(host(CredentialPolicy::new(false, true)), &cancel);

    let err = client
        .git_credentials_for(&GitCredentials {
            protocol: "https".into(),
            host: "github.com".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "git credentials forbidden");

    let user = client.git_user_typed().await.unwrap();
    assert_eq!(user.name, "Dev");
    cancel.cancel();
}

#[tokio::test]
async fn result_survives_session_end() {
    let cancel = CancellationToken::new();
    let (client, task) = connect(host(CredentialPolicy::default()), &cancel);

    client
        .send_result(Message::new(r#"{"containerDetails":{"id":"abc"}}"#))
        .await
        .unwrap();
    let err = client.send_result(Message::new("{oops")).await.unwrap_err();
    assert_eq!(err.code(), Code::Protocol);

    cancel.cancel();
    let result = task.await.unwrap().unwrap().expect("stored result");
    assert_eq!(result.container_details.unwrap()["id"], "abc");
}

#[tokio::test]
async fn session_without_result_yields_none() {
    let cancel = CancellationToken::new();
    let (client, task) = connect(host(CredentialPolicy::default()), &cancel);
    client.ping().await.unwrap();
    cancel.cancel();
    assert!(task.await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn relay_round_trips_and_captures_result() {
    let cancel = CancellationToken::new();
    let forwarder = Arc::new(RecordingForwarder::default());
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("README.md"), "hello from the host").unwrap();

    let upstream_server = Arc::new(
        HostTunnelServer::new(CredentialPolicy::default())
            .with_broker(Arc::new(FakeStore))
            .with_forwarder(forwarder.clone())
            .with_workspace(Workspace::local(dir.path())),
    );
    let (upstream, upstream_task) = connect(upstream_server, &cancel);
    let upstream: Arc<TunnelClient> = Arc::new(upstream);

    let relay = Arc::new(RelayTunnelServer::new(
        upstream.clone(),
        CredentialPolicy::default(),
    ));
    let (client, relay_task) = connect(relay, &cancel);

    client.ping().await.unwrap();
    client.forward_port(PortRequest::new("3000")).await.unwrap();
    client.stop_forward_port(PortRequest::new("3000")).await.unwrap();
    assert_eq!(
        *forwarder.0.lock().unwrap(),
        vec!["forward 3000", "stop 3000"]
    );

    // credential policy is enforced at the relay too
    let err = client.docker_credentials_for("").await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let mut reader = chunk_reader(client.stream_workspace().await.unwrap());
    let mut archive = Vec::new();
    reader.read_to_end(&mut archive).await.unwrap();
    let mut found = String::new();
    for entry in tar::Archive::new(archive.as_slice()).entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == "README.md" {
            entry.read_to_string(&mut found).unwrap();
        }
    }
    assert_eq!(found, "hello from the host");

    client
        .send_result(Message::new(r#"{"mergedConfig":{"image":"rust"}}"#))
        .await
        .unwrap();

    cancel.cancel();
    let relayed = relay_task.await.unwrap().unwrap().expect("relay result");
    let upstream_result = upstream_task.await.unwrap().unwrap().expect("host result");
    assert_eq!(relayed, upstream_result);
    assert_eq!(relayed.merged_config.unwrap()["image"], "rust");
}

#[tokio::test]
async fn commit_signing_through_relay() {
    let cancel = CancellationToken::new();
    let (upstream, _t1) = connect(host(CredentialPolicy::new(true, false)), &cancel);
    let upstream = Arc::new(upstream);
    let (signing, _t2) = connect(
        Arc::new(RelayTunnelServer::new(
            upstream.clone(),
            CredentialPolicy::new(true, false),
        )),
        &cancel,
    );
    let (locked, _t3) = connect(
        Arc::new(RelayTunnelServer::new(upstream, CredentialPolicy::default())),
        &cancel,
    );

    let request = GitSshSignatureRequest {
        content: "tree 4b825dc6".into(),
        key_path: "/home/dev/.ssh/id_ed25519.pub".into(),
    };
    let resp = signing.git_ssh_signature_for(&request).await.unwrap();
    assert_eq!(
        resp.signature,
        "c2lnbmVkIHRyZWUgNGI4MjVkYzYgd2l0aCAvaG9tZS9kZXYvLnNzaC9pZF9lZDI1NTE5LnB1Yg=="
    );

    let err = locked.git_ssh_signature_for(&request).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.to_string(), "git credentials forbidden");

    // gpg public keys pass through either way
    let keys = locked.gpg_public_keys().await.unwrap();
    assert_eq!(keys.message, "LS0tLS1CRUdJTiBQR1AgUFVCTElDIEtFWSBCTE9DSy0tLS0t");
    cancel.cancel();
}

#[tokio::test]
async fn relay_errors_match_upstream_errors() {
    let cancel = CancellationToken::new();
    let (direct, _t1) = connect(host(CredentialPolicy::default()), &cancel);
    let (upstream, _t2) = connect(host(CredentialPolicy::default()), &cancel);
    let relay = Arc::new(RelayTunnelServer::new(
        Arc::new(upstream),
        CredentialPolicy::new(true, true),
    ));
    let (relayed, _t3) = connect(relay, &cancel);

    let a = direct.forward_port(PortRequest::new("8080")).await.unwrap_err();
    let b = relayed.forward_port(PortRequest::new("8080")).await.unwrap_err();
    assert_eq!(a.to_string(), "cannot forward ports");
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a.code(), b.code());
    cancel.cancel();
}

#[tokio::test]
async fn dropped_server_fails_calls() {
    let (client_reader, server_writer) = pipe();
    let (server_reader, client_writer) = pipe();
    let client = TunnelClient::new(client_reader, client_writer, false);
    drop((server_reader, server_writer));
    client.closed().await;
    let err = client.ping().await.unwrap_err();
    assert!(matches!(
        err.root(),
        TunnelError::Transport(_) | TunnelError::Io(_)
    ));
}
