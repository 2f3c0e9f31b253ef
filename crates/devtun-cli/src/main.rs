//! devtun: drive a dev container through stdio tunnels.
//!
//! The same binary is the orchestrator (`up`, `ssh`) and the agent side
//! (`agent ...`) that runs on the far end of a tunnel.

mod commands;

use clap::{Parser, Subcommand};
use devtun_cli::Config;
use devtun_client::TunnelLogLayer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// devtun: dev container tunnels over stdio
#[derive(Parser)]
#[command(name = "devtun", version, about = "Dev container tunnels over stdio byte streams")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long = "debug", alias = "verbose", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Commands that run on the remote side of a tunnel
    #[command(subcommand)]
    Agent(AgentCommand),

    /// Run an agent command on the host and serve the workspace to it
    Up {
        /// Shell prefix that reaches the host, e.g. "ssh myhost"
        #[arg(long)]
        inject: String,

        /// Local workspace folder
        #[arg(long, conflicts_with = "git")]
        workspace: Option<PathBuf>,

        /// Git source instead of a local folder (repo[@branch|@sha256:commit|@pull/N/head])
        #[arg(long)]
        git: Option<String>,

        /// Agent command to run on the host
        #[arg(long)]
        command: Option<String>,
    },

    /// Run a command inside the container through the host
    Ssh {
        /// Shell prefix that reaches the host, e.g. "ssh myhost"
        #[arg(long)]
        inject: String,

        /// Serialized workspace info understood by the agent
        #[arg(long)]
        workspace_info: String,

        /// Container user for the credentials server
        #[arg(long, default_value = "root")]
        user: String,

        /// Forward ports the container opens
        #[arg(long)]
        forward_ports: bool,

        /// Command to run in the container
        #[arg(long)]
        command: String,
    },
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Watch listening sockets and ask the peer to forward them
    ForwardPorts,

    /// Serve the runner tunnel on stdio
    TunnelServer {
        #[arg(long)]
        allow_git_credentials: bool,

        #[arg(long)]
        allow_docker_credentials: bool,

        /// Exit after this many seconds without a session (0 = never)
        #[arg(long)]
        exit_after: Option<u64>,
    },
}

fn default_filter(debug: bool) -> &'static str {
    if debug {
        "devtun=debug,devtun_cli=debug,devtun_client=debug,devtun_core=debug,devtun_server=debug"
    } else {
        "devtun=info,devtun_cli=info,devtun_server=info"
    }
}

/// Logs go to stderr: agent commands own stdout for the tunnel.
fn init_tracing(debug: bool, remote: Option<TunnelLogLayer>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(debug),
        )
        .with(remote)
        .init();
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("devtun: {e:#}");
            std::process::exit(1);
        }
    };
    let debug = cli.debug || config.agent.debug;
    let cancel = shutdown_token();

    let result = match cli.command {
        Command::Agent(AgentCommand::ForwardPorts) => {
            commands::agent::forward_ports(&cancel, debug, init_tracing).await
        }
        Command::Agent(AgentCommand::TunnelServer {
            allow_git_credentials,
            allow_docker_credentials,
            exit_after,
        }) => {
            init_tracing(debug, None);
            commands::agent::tunnel_server(
                &cancel,
                &config,
                allow_git_credentials,
                allow_docker_credentials,
                exit_after,
            )
            .await
        }
        Command::Up {
            inject,
            workspace,
            git,
            command,
        } => {
            init_tracing(debug, None);
            let source = commands::up::Source::from_args(workspace, git);
            commands::up::run(&cancel, &config, debug, &inject, source, command).await
        }
        Command::Ssh {
            inject,
            workspace_info,
            user,
            forward_ports,
            command,
        } => {
            init_tracing(debug, None);
            let target = commands::ssh::Target {
                inject,
                workspace_info,
                user,
                forward_ports,
                command,
            };
            commands::ssh::run(&cancel, &config, debug, target).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("devtun: {e:#}");
        std::process::exit(1);
    }
}
