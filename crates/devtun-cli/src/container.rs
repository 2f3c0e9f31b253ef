//! Three-hop tunnel: orchestrator → host → container.
//!
//! The agent helper is injected on the host and speaks the server role over
//! its stdio. Over that host session a second command bridges to the
//! container's server, and a second client connects through it. Both hops
//! use [`run_nested`], so a failure anywhere unwinds the whole chain.

use crate::remote;
use crate::inject::Injector;
use crate::log_writer::LogWriter;
use crate::ssh::{RunOptions, SshClient, SshConnector};
use crate::tunnel::{run_nested, Labels};
use async_trait::async_trait;
use devtun_core::{ResultExt, TunnelResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Level};

pub const UPDATE_CONFIG_INTERVAL: Duration = Duration::from_secs(30);

/// Serialized workspace description handed to agent commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInfo {
    pub workspace_info: String,
    /// Agent data directory on the host, when it differs from the default.
    pub data_path: Option<String>,
}

/// The workspace provider, as far as the tunnel needs it.
#[async_trait]
pub trait WorkspaceClient: Injector {
    fn agent_path(&self) -> &str;

    fn debug(&self) -> bool;

    async fn agent_info(&self) -> TunnelResult<AgentInfo>;

    /// Re-resolve provider options before the next config push.
    async fn refresh_options(&self) -> TunnelResult<()>;
}

pub struct ContainerTunnel {
    client: Arc<dyn WorkspaceClient>,
    connector: Arc<dyn SshConnector>,
    update_config_interval: Duration,
    env: Vec<(String, String)>,
}

impl ContainerTunnel {
    pub fn new(client: Arc<dyn WorkspaceClient>, connector: Arc<dyn SshConnector>) -> Self {
        Self {
            client,
            connector,
            update_config_interval: UPDATE_CONFIG_INTERVAL,
            env: Vec::new(),
        }
    }

    /// Zero disables the periodic config push.
    pub fn with_update_config_interval(mut self, interval: Duration) -> Self {
        self.update_config_interval = interval;
        self
    }

    /// Environment for the container bridge command.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Connect to the container and run `handler` with its client.
    pub async fn run<H, HFut>(&self, parent: &CancellationToken, handler: H) -> TunnelResult<()>
    where
        H: FnOnce(CancellationToken, Arc<dyn SshClient>) -> HFut + Send + 'static,
        HFut: Future<Output = TunnelResult<()>> + Send + 'static,
    {
        let client = self.client.clone();
        let injector = self.client.clone();
        let connector = self.connector.clone();
        let interval = self.update_config_interval;
        let env = self.env.clone();
        let helper = remote::helper_ssh_server(client.agent_path(), client.debug());

        run_nested(
            parent,
            self.connector.clone(),
            move |cancel, stdin, stdout| async move {
                let stderr = Box::new(LogWriter::new(Level::INFO));
                let result = injector
                    .inject_and_execute(cancel, helper, stdin, stdout, stderr)
                    .await;
                debug!("tunnel to host closed");
                result
            },
            move |cancel, host| async move {
                debug!("connected to host");
                if !interval.is_zero() {
                    tokio::spawn(update_config_loop(
                        client.clone(),
                        host.clone(),
                        interval,
                        cancel.clone(),
                    ));
                }
                run_in_container(&cancel, client, connector, host, env, handler).await
            },
            Labels {
                outer: "connect to server",
                inner: "tunnel to container",
            },
        )
        .await
    }
}

async fn run_in_container<H, HFut>(
    parent: &CancellationToken,
    client: Arc<dyn WorkspaceClient>,
    connector: Arc<dyn SshConnector>,
    host: Arc<dyn SshClient>,
    env: Vec<(String, String)>,
    handler: H,
) -> TunnelResult<()>
where
    H: FnOnce(CancellationToken, Arc<dyn SshClient>) -> HFut + Send + 'static,
    HFut: Future<Output = TunnelResult<()>> + Send + 'static,
{
    let info = client.agent_info().await.context("run in container")?;
    let bridge =
        remote::container_tunnel(client.agent_path(), &info.workspace_info, client.debug());

    run_nested(
        parent,
        connector,
        move |cancel, stdin, stdout| async move {
            debug!("run container tunnel");
            let options = RunOptions::new(bridge)
                .env(env)
                .stdin(stdin)
                .stdout(stdout)
                .stderr(LogWriter::new(Level::INFO));
            match host.run(cancel, options).await {
                Err(e) if !e.is_cancelled() => error!(error = %e, "error tunneling to container"),
                _ => {}
            }
            debug!("container tunnel exited");
            Ok(())
        },
        handler,
        Labels {
            outer: "container tunnel",
            inner: "run in container",
        },
    )
    .await
}

async fn update_config_loop(
    client: Arc<dyn WorkspaceClient>,
    host: Arc<dyn SshClient>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        debug!("start refresh");
        if let Err(e) = update_config(client.as_ref(), host.as_ref(), &cancel).await {
            error!(error = %e, "error updating remote workspace");
        }
    }
}

async fn update_config(
    client: &dyn WorkspaceClient,
    host: &dyn SshClient,
    cancel: &CancellationToken,
) -> TunnelResult<()> {
    client
        .refresh_options()
        .await
        .context("refresh workspace options")?;
    let info = client
        .agent_info()
        .await
        .context("compress workspace info")?;
    let command = remote::update_config(
        client.agent_path(),
        &info.workspace_info,
        info.data_path.as_deref(),
    );
    debug!(command = %command, "run command on host");
    let options = RunOptions::new(command)
        .stdout(LogWriter::new(Level::DEBUG))
        .stderr(LogWriter::new(Level::DEBUG));
    host.run(cancel.child_token(), options)
        .await
        .context("run update-config")
}
