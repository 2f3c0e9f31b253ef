//! Host-only command execution.
//!
//! Three parties run at once: the injected helper on the host, a client
//! session that runs one agent command over it, and a tunnel server on the
//! agent command's stdio. The server stops once either of the other two is
//! done; whatever result the agent delivered is returned, even next to an
//! error.

use crate::inject::Injector;
use crate::log_writer::LogWriter;
use crate::ssh::{agent_socket, RunOptions, SshConnector};
use devtun_core::{pipe, DevcontainerResult, ResultExt, Tunnel, TunnelError, TunnelResult};
use devtun_server::{
    run_with_result, CredentialPolicy, GitOverride, HostTunnelServer, RelayTunnelServer,
    RunnerTunnelServer,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};

/// Which server answers the agent command.
pub enum ServerMode {
    /// Full host server bound to the workspace.
    Up(HostTunnelServer),
    /// Minimal server for runner-style setups.
    Runner(RunnerTunnelServer),
    /// Relay to `upstream`, keeping a copy of the result here. The caller
    /// owns the upstream and keeps it alive past the session.
    Proxy {
        upstream: Arc<dyn Tunnel>,
        policy: CredentialPolicy,
        git_override: Option<GitOverride>,
    },
}

/// Outcome of [`execute_command`].
#[derive(Debug)]
pub struct Execution {
    pub result: Option<DevcontainerResult>,
    pub error: Option<TunnelError>,
}

impl Execution {
    fn failed(error: TunnelError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    /// Drop the partial result when there is an error.
    pub fn into_result(self) -> TunnelResult<Option<DevcontainerResult>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result),
        }
    }
}

/// Cancellation and termination by signal are how the helper normally ends.
fn is_benign(e: &TunnelError) -> bool {
    e.is_cancelled() || e.to_string().contains("signal: ")
}

/// Inject `helper_command` on the host, connect to it, run `command` there,
/// and serve `mode` on that command's stdio until one side is done.
pub async fn execute_command(
    parent: &CancellationToken,
    injector: Arc<dyn Injector>,
    connector: Arc<dyn SshConnector>,
    helper_command: String,
    command: String,
    mode: ServerMode,
) -> Execution {
    let cancel = parent.child_token();
    let (helper_stdin, ssh_writer) = pipe();
    let (ssh_reader, helper_stdout) = pipe();
    let (agent_stdin, server_writer) = pipe();
    let (server_reader, agent_stdout) = pipe();

    let mut tasks = JoinSet::new();

    let helper_cancel = cancel.clone();
    tasks.spawn(async move {
        let _done = helper_cancel.clone().drop_guard();
        debug!(command = %helper_command, "inject and run command");
        let stderr = Box::new(LogWriter::new(Level::INFO));
        let result = injector
            .inject_and_execute(
                helper_cancel,
                helper_command,
                helper_stdin,
                helper_stdout,
                stderr,
            )
            .await;
        debug!("done executing ssh server helper command");
        match result {
            Err(e) if !is_benign(&e) => Err(e.context("executing agent command")),
            _ => Ok(()),
        }
    });

    let agent_cancel = cancel.clone();
    tasks.spawn(async move {
        let _done = agent_cancel.clone().drop_guard();
        debug!("attempting to create ssh client");
        let client = connector
            .connect(ssh_reader, ssh_writer)
            .await
            .context("create ssh client")?;
        debug!("ssh client created");

        let options = RunOptions::new(command)
            .stdin(agent_stdin)
            .stdout(agent_stdout)
            .stderr(LogWriter::new(Level::INFO))
            .forward_agent(agent_socket().is_some());
        let result = client.run(agent_cancel, options).await;
        client.close().await;
        debug!("connection to ssh server closed");
        result.context("run agent command")
    });

    let served = match mode {
        ServerMode::Up(server) => {
            run_with_result(&cancel, server_reader, server_writer, Arc::new(server))
                .await
                .context("run tunnel machine")
        }
        ServerMode::Runner(server) => {
            run_with_result(&cancel, server_reader, server_writer, Arc::new(server))
                .await
                .context("run tunnel machine")
        }
        ServerMode::Proxy {
            upstream,
            policy,
            git_override,
        } => {
            let relay = RelayTunnelServer::new(upstream, policy).with_git_override(git_override);
            run_with_result(&cancel, server_reader, server_writer, Arc::new(relay))
                .await
                .context("run proxy tunnel")
        }
    };
    let result = match served {
        Ok(result) => result,
        Err(e) => {
            cancel.cancel();
            return Execution::failed(e);
        }
    };

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(TunnelError::from).and_then(|r| r);
        if let Err(error) = outcome {
            return Execution {
                result,
                error: Some(error),
            };
        }
    }
    Execution {
        result,
        error: None,
    }
}
