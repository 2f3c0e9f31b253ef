//! Services for a connected container: credentials and port forwarding.
//!
//! The host variant is served locally while the container runs its
//! credentials server on the other end of the same session. Ports the
//! container reports are forwarded over `direct-tcpip` channels.

use crate::remote::{self, CredentialsServerFlags};
use crate::log_writer::LogWriter;
use crate::ssh::{RunOptions, SshClient};
use async_trait::async_trait;
use devtun_core::{pipe, ResultExt, TunnelResult};
use devtun_server::{
    serve_tunnel, CredentialPolicy, GitOverride, HostTunnelServer, PortForwarder, PortRelay,
    Workspace,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};

/// Accepts connections on `localhost:<port>` and tunnels each one to the
/// same port inside the container.
pub struct SshPortRelay {
    client: Arc<dyn SshClient>,
}

impl SshPortRelay {
    pub fn new(client: Arc<dyn SshClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PortRelay for SshPortRelay {
    async fn relay(&self, port: u16, cancel: CancellationToken) -> TunnelResult<()> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .context(format!("listen on localhost:{port}"))?;
        info!(port, "forwarding port");

        loop {
            let (mut socket, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(port, "stopped forwarding port");
                    return Ok(());
                }
                accepted = listener.accept() => accepted.context("accept connection")?,
            };
            debug!(port, peer = %peer, "forwarded connection");

            let client = self.client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut remote = match client.open_direct_tcpip("localhost", port).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        error!(port, error = %e, "error opening channel");
                        return;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    copied = tokio::io::copy_bidirectional(&mut socket, &mut remote) => {
                        if let Err(e) = copied {
                            debug!(port, error = %e, "forwarded connection closed");
                        }
                    }
                }
            });
        }
    }
}

#[derive(Default)]
pub struct ServicesOptions {
    /// Container user the credentials server runs as.
    pub user: String,
    pub policy: CredentialPolicy,
    pub forward_ports: bool,
    pub excluded_ports: Vec<String>,
    pub git_override: Option<GitOverride>,
    pub workspace: Option<Workspace>,
    pub debug: bool,
}

/// Serve the host variant to the container's credentials server until the
/// remote command exits or `parent` is cancelled.
pub async fn run_services(
    parent: &CancellationToken,
    container: Arc<dyn SshClient>,
    options: ServicesOptions,
) -> TunnelResult<()> {
    let cancel = parent.child_token();
    let (server_reader, command_stdout) = pipe();
    let (command_stdin, server_writer) = pipe();

    let mut server = HostTunnelServer::new(options.policy)
        .with_git_override(options.git_override.clone());
    if options.forward_ports {
        let relay = Arc::new(SshPortRelay::new(container.clone()));
        server = server.with_forwarder(Arc::new(PortForwarder::new(
            relay,
            options.excluded_ports.clone(),
            cancel.clone(),
        )));
    }
    if let Some(workspace) = options.workspace.clone() {
        server = server.with_workspace(workspace);
    }

    let server_cancel = cancel.clone();
    let served = tokio::spawn(async move {
        let _done = server_cancel.clone().drop_guard();
        serve_tunnel(&server_cancel, server_reader, server_writer, Arc::new(server))
            .await
            .context("run tunnel server")
    });

    let command = remote::credentials_server(
        remote::CONTAINER_HELPER_PATH,
        &options.user,
        CredentialsServerFlags {
            configure_git_helper: options.policy.allow_git,
            configure_docker_helper: options.policy.allow_docker,
            forward_ports: options.forward_ports,
            debug: options.debug,
        },
    );
    debug!(command = %command, "starting credentials server");
    let run = RunOptions::new(command)
        .stdin(command_stdin)
        .stdout(command_stdout)
        .stderr(LogWriter::new(Level::DEBUG));
    let ran = container.run(cancel.clone(), run).await;

    cancel.cancel();
    let served = served.await?;
    ran?;
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::FakeConnector;
    use devtun_client::TunnelClient;
    use devtun_core::{PortRequest, Tunnel, TunnelError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn connected(connector: &FakeConnector) -> Arc<dyn SshClient> {
        use crate::ssh::SshConnector;
        let (reader, _) = pipe();
        let (_, writer) = pipe();
        connector.connect(reader, writer).await.unwrap()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn relay_tunnels_local_connections() {
        let client = connected(&FakeConnector::draining()).await;
        let relay = SshPortRelay::new(client);
        let port = free_port();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { relay.relay(port, cancel).await }
        });

        let mut stream = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(_) => tokio::task::yield_now().await,
            }
        };
        stream.write_all(b"echo me").await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo me");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn credentials_server_talks_to_host_variant() {
        let connector = FakeConnector::new(|_cancel, options: RunOptions| async move {
            let (Some(stdin), Some(stdout)) = (options.stdin, options.stdout) else {
                return Err(TunnelError::Protocol("missing stdio".into()));
            };
            let client = TunnelClient::new(stdin, stdout, false);
            client.ping().await?;
            let err = client
                .forward_port(PortRequest::new("3000"))
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "cannot forward ports");
            let err = client.docker_credentials_for("").await.unwrap_err();
            assert!(err.to_string().contains("forbidden"));
            Ok(())
        });
        let commands = connector.commands.clone();
        let container = connected(&connector).await;

        run_services(
            &CancellationToken::new(),
            container,
            ServicesOptions {
                user: "vscode".into(),
                policy: CredentialPolicy::new(true, false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(
            *commands.lock().unwrap(),
            vec!["'/usr/local/bin/devpod' agent container credentials-server --user 'vscode' --configure-git-helper"]
        );
    }

    #[tokio::test]
    async fn remote_failure_is_returned() {
        let connector = FakeConnector::new(|_cancel, _options: RunOptions| async {
            Err(TunnelError::Transport("process exited with status 1".into()))
        });
        let container = connected(&connector).await;
        let err = run_services(&CancellationToken::new(), container, ServicesOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "transport error: process exited with status 1");
    }
}
