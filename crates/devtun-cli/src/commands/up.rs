//! `devtun up`: run an agent command on the host and serve it the workspace.

use anyhow::{bail, Context, Result};
use devtun_cli::remote::{self, quote};
use devtun_cli::{execute_command, Config, ProcessInjector, RusshConnector, ServerMode};
use devtun_server::{CredentialPolicy, GitOverride, GitSource, HostTunnelServer, Workspace};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub enum Source {
    Local(PathBuf),
    Git(String),
    Missing,
}

impl Source {
    pub fn from_args(workspace: Option<PathBuf>, git: Option<String>) -> Self {
        match (workspace, git) {
            (_, Some(git)) => Source::Git(git),
            (Some(folder), None) => Source::Local(folder),
            (None, None) => Source::Missing,
        }
    }

    fn into_workspace(self) -> Result<Workspace> {
        match self {
            Source::Local(folder) => {
                let folder = folder
                    .canonicalize()
                    .with_context(|| format!("workspace folder {}", folder.display()))?;
                Ok(Workspace::local(folder))
            }
            Source::Git(source) => Ok(Workspace::git(GitSource::parse(&source))),
            Source::Missing => bail!("either --workspace or --git is required"),
        }
    }
}

pub async fn run(
    cancel: &CancellationToken,
    config: &Config,
    debug: bool,
    inject: &str,
    source: Source,
    command: Option<String>,
) -> Result<()> {
    let workspace = source.into_workspace()?;
    let credentials = &config.credentials;
    let git_override = GitOverride::new(
        credentials.git_username.clone().unwrap_or_default(),
        credentials.git_token.clone().unwrap_or_default(),
    );
    let server = HostTunnelServer::new(CredentialPolicy::new(
        credentials.inject_git,
        credentials.inject_docker,
    ))
    .with_workspace(workspace)
    .with_git_override(git_override);

    let agent = &config.agent.path;
    let helper = remote::helper_ssh_server(agent, debug);
    let command = command.unwrap_or_else(|| format!("{} agent workspace up", quote(agent)));

    let execution = execute_command(
        cancel,
        Arc::new(ProcessInjector::new(inject)),
        Arc::new(RusshConnector::default()),
        helper,
        command,
        ServerMode::Up(server),
    )
    .await;

    match &execution.result {
        Some(result) => println!("{}", serde_json::to_string_pretty(result)?),
        None => warn!("agent finished without a result"),
    }
    execution.into_result()?;
    info!("done");
    Ok(())
}
