//! Polls the socket table and keeps the forwarder in sync with it.

use crate::netstat::SocketEnumerator;
use devtun_core::{Forwarder, TunnelResult};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const WATCH_INTERVAL: Duration = Duration::from_secs(3);

/// Ports considered for forwarding.
pub const FORWARDABLE_PORTS: RangeInclusive<u16> = 1024..=12000;

pub struct Watcher {
    sockets: Arc<dyn SocketEnumerator>,
    forwarder: Arc<dyn Forwarder>,
    tracked: BTreeSet<String>,
}

impl Watcher {
    pub fn new(sockets: Arc<dyn SocketEnumerator>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            sockets,
            forwarder,
            tracked: BTreeSet::new(),
        }
    }

    /// Tick every [`WATCH_INTERVAL`] until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(WATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "error listing ports");
            }
        }
    }

    /// One reconciliation pass.
    ///
    /// Individual errors are logged and never abort the pass. The tracked
    /// set is replaced by the observed one minus ports whose forward failed,
    /// so those are tried again on the next tick.
    pub async fn tick(&mut self) -> TunnelResult<()> {
        let mut current: BTreeSet<String> = self
            .sockets
            .tcp_sockets()
            .await?
            .into_iter()
            .filter(|s| s.is_listening() && s.local_addr.is_some())
            .filter(|s| FORWARDABLE_PORTS.contains(&s.port))
            .map(|s| s.port.to_string())
            .collect();

        for port in self.tracked.difference(&current) {
            debug!(port = %port, "port closed");
            if let Err(e) = self.forwarder.stop_forward(port).await {
                error!(port = %port, error = %e, "error stop forwarding port");
            }
        }
        let mut failed = Vec::new();
        for port in current.difference(&self.tracked) {
            debug!(port = %port, "port opened");
            if let Err(e) = self.forwarder.forward(port).await {
                error!(port = %port, error = %e, "error forwarding port");
                failed.push(port.clone());
            }
        }
        for port in &failed {
            current.remove(port);
        }

        self.tracked = current;
        Ok(())
    }

    pub fn tracked(&self) -> &BTreeSet<String> {
        &self.tracked
    }
}
