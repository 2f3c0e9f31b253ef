//! `devtun ssh`: run a command in the container, two hops away.

use anyhow::Result;
use async_trait::async_trait;
use devtun_cli::ssh::{agent_socket, BoxWriter};
use devtun_cli::{
    run_services, AgentInfo, Config, ContainerTunnel, Injector, ProcessInjector, RunOptions,
    RusshConnector, ServicesOptions, WorkspaceClient,
};
use devtun_core::{PipeReader, PipeWriter, TunnelResult};
use devtun_server::{CredentialPolicy, GitOverride};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct Target {
    pub inject: String,
    pub workspace_info: String,
    pub user: String,
    pub forward_ports: bool,
    pub command: String,
}

/// A workspace whose description was handed over on the command line.
struct StaticWorkspace {
    injector: ProcessInjector,
    agent_path: String,
    debug: bool,
    info: AgentInfo,
}

#[async_trait]
impl Injector for StaticWorkspace {
    async fn inject_and_execute(
        &self,
        cancel: CancellationToken,
        command: String,
        stdin: PipeReader,
        stdout: PipeWriter,
        stderr: BoxWriter,
    ) -> TunnelResult<()> {
        self.injector
            .inject_and_execute(cancel, command, stdin, stdout, stderr)
            .await
    }
}

#[async_trait]
impl WorkspaceClient for StaticWorkspace {
    fn agent_path(&self) -> &str {
        &self.agent_path
    }

    fn debug(&self) -> bool {
        self.debug
    }

    async fn agent_info(&self) -> TunnelResult<AgentInfo> {
        Ok(self.info.clone())
    }

    async fn refresh_options(&self) -> TunnelResult<()> {
        Ok(())
    }
}

pub async fn run(
    cancel: &CancellationToken,
    config: &Config,
    debug: bool,
    target: Target,
) -> Result<()> {
    let workspace = StaticWorkspace {
        injector: ProcessInjector::new(&target.inject),
        agent_path: config.agent.path.clone(),
        debug,
        info: AgentInfo {
            workspace_info: target.workspace_info.clone(),
            data_path: config.agent.dir.clone(),
        },
    };
    let services = ServicesOptions {
        user: target.user.clone(),
        policy: CredentialPolicy::new(
            config.credentials.inject_git,
            config.credentials.inject_docker,
        ),
        forward_ports: target.forward_ports,
        excluded_ports: config.forward.excluded_ports.clone(),
        git_override: GitOverride::new(
            config.credentials.git_username.clone().unwrap_or_default(),
            config.credentials.git_token.clone().unwrap_or_default(),
        ),
        workspace: None,
        debug,
    };
    let command = target.command;

    let tunnel = ContainerTunnel::new(Arc::new(workspace), Arc::new(RusshConnector::default()))
        .with_update_config_interval(config.tunnel.update_config_interval());
    tunnel
        .run(cancel, move |cancel, container| async move {
            let services_cancel = cancel.child_token();
            let services_task = tokio::spawn({
                let container = container.clone();
                let services_cancel = services_cancel.clone();
                async move {
                    if let Err(e) = run_services(&services_cancel, container, services).await {
                        error!(error = %e, "error running services");
                    }
                }
            });

            let options = RunOptions::new(command)
                .stdin(tokio::io::stdin())
                .stdout(tokio::io::stdout())
                .stderr(tokio::io::stderr())
                .forward_agent(agent_socket().is_some());
            let result = container.run(cancel, options).await;

            services_cancel.cancel();
            let _ = services_task.await;
            result
        })
        .await?;
    Ok(())
}
