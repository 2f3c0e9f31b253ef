//! `devtun agent ...`: the far end of a tunnel.

use anyhow::Result;
use devtun_cli::Config;
use devtun_client::{RemoteForwarder, TunnelClient, TunnelLogLayer};
use devtun_core::ConnectionCounter;
use devtun_server::{serve_stdio, CredentialPolicy, ProcNetEnumerator, RunnerTunnelServer, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Report listening ports to the peer until it goes away.
///
/// Logging is set up here so local events also reach the peer.
pub async fn forward_ports(
    cancel: &CancellationToken,
    debug: bool,
    init_tracing: fn(bool, Option<TunnelLogLayer>),
) -> Result<()> {
    let tunnel = Arc::new(TunnelClient::from_stdio());
    let (layer, _log_task) = TunnelLogLayer::new(tunnel.clone(), debug);
    init_tracing(debug, Some(layer));

    let watcher = Watcher::new(
        Arc::new(ProcNetEnumerator),
        Arc::new(RemoteForwarder::new(tunnel.clone())),
    );
    info!("watching for listening ports");
    tokio::select! {
        _ = watcher.run(cancel.clone()) => {}
        _ = tunnel.closed() => debug!("tunnel closed"),
    }
    Ok(())
}

/// Serve the runner variant on stdio.
pub async fn tunnel_server(
    cancel: &CancellationToken,
    config: &Config,
    allow_git_credentials: bool,
    allow_docker_credentials: bool,
    exit_after: Option<u64>,
) -> Result<()> {
    let policy = CredentialPolicy::new(allow_git_credentials, allow_docker_credentials);
    let server = Arc::new(RunnerTunnelServer::new(policy));

    let exit_after = exit_after
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.tunnel.exit_after());
    let counter = (!exit_after.is_zero()).then(|| {
        let idle = cancel.clone();
        ConnectionCounter::new(exit_after, move || {
            info!("no active session, shutting down");
            idle.cancel();
        })
    });

    debug!(?policy, ?exit_after, "serving tunnel on stdio");
    serve_stdio(cancel, server, counter).await?;
    Ok(())
}
