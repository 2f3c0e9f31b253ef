//! Per-port forward lifecycle.

use async_trait::async_trait;
use devtun_core::{Forwarder, TunnelError, TunnelResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Moves traffic for one port between the local side and the remote side
/// until `cancel` fires.
#[async_trait]
pub trait PortRelay: Send + Sync {
    async fn relay(&self, port: u16, cancel: CancellationToken) -> TunnelResult<()>;
}

struct Handle {
    id: u64,
    cancel: CancellationToken,
}

type Active = Arc<Mutex<HashMap<String, Handle>>>;

fn lock(active: &Active) -> MutexGuard<'_, HashMap<String, Handle>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

/// [`Forwarder`] that runs one relay task per forwarded port.
///
/// Each active port owns a child of the parent token; stopping the port
/// cancels that child, cancelling the parent stops everything. A relay
/// that fails drops its port so the next forward starts a fresh one.
pub struct PortForwarder {
    relay: Arc<dyn PortRelay>,
    excluded: HashSet<String>,
    active: Active,
    next_id: AtomicU64,
    parent: CancellationToken,
}

impl PortForwarder {
    pub fn new(
        relay: Arc<dyn PortRelay>,
        excluded: impl IntoIterator<Item = String>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            relay,
            excluded: excluded.into_iter().collect(),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            parent,
        }
    }

    /// Ports with a live forward.
    pub fn active_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = lock(&self.active).keys().cloned().collect();
        ports.sort();
        ports
    }
}

#[async_trait]
impl Forwarder for PortForwarder {
    async fn forward(&self, port: &str) -> TunnelResult<()> {
        if self.excluded.contains(port) {
            return Ok(());
        }
        let number: u16 = port
            .parse()
            .map_err(|_| TunnelError::Protocol(format!("invalid port {port:?}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = {
            let mut active = lock(&self.active);
            if active.contains_key(port) {
                return Ok(());
            }
            let token = self.parent.child_token();
            active.insert(
                port.to_string(),
                Handle {
                    id,
                    cancel: token.clone(),
                },
            );
            token
        };

        info!(port = %port, "forwarding port");
        let relay = self.relay.clone();
        let active = self.active.clone();
        let port = port.to_string();
        tokio::spawn(async move {
            if let Err(e) = relay.relay(number, token).await {
                error!(port = number, error = %e, "port forward ended");
                let mut active = lock(&active);
                // a stop and re-forward may already own the slot
                if active.get(&port).is_some_and(|h| h.id == id) {
                    active.remove(&port);
                }
            }
        });
        Ok(())
    }

    async fn stop_forward(&self, port: &str) -> TunnelResult<()> {
        if self.excluded.contains(port) {
            return Ok(());
        }
        let handle = lock(&self.active).remove(port);
        if let Some(handle) = handle {
            debug!(port = %port, "stop forwarding port");
            handle.cancel.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingRelay {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl PortRelay for CountingRelay {
        async fn relay(&self, _port: u16, cancel: CancellationToken) -> TunnelResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn forwarder(relay: Arc<CountingRelay>, excluded: &[&str]) -> PortForwarder {
        PortForwarder::new(
            relay,
            excluded.iter().map(|p| p.to_string()),
            CancellationToken::new(),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn double_forward_keeps_one_handle() {
        let relay = Arc::new(CountingRelay::default());
        let fwd = forwarder(relay.clone(), &[]);
        fwd.forward("3000").await.unwrap();
        fwd.forward("3000").await.unwrap();
        settle().await;
        assert_eq!(fwd.active_ports(), vec!["3000".to_string()]);
        assert_eq!(relay.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_unknown_port_is_ok() {
        let fwd = forwarder(Arc::new(CountingRelay::default()), &[]);
        fwd.stop_forward("4000").await.unwrap();
        assert!(fwd.active_ports().is_empty());
    }

    #[tokio::test]
    async fn stop_cancels_the_relay() {
        let relay = Arc::new(CountingRelay::default());
        let fwd = forwarder(relay.clone(), &[]);
        fwd.forward("3000").await.unwrap();
        settle().await;
        fwd.stop_forward("3000").await.unwrap();
        settle().await;
        assert_eq!(relay.finished.load(Ordering::SeqCst), 1);
        assert!(fwd.active_ports().is_empty());
    }

    #[tokio::test]
    async fn excluded_ports_are_ignored() {
        let relay = Arc::new(CountingRelay::default());
        let fwd = forwarder(relay.clone(), &["5432"]);
        fwd.forward("5432").await.unwrap();
        fwd.stop_forward("5432").await.unwrap();
        settle().await;
        assert!(fwd.active_ports().is_empty());
        assert_eq!(relay.started.load(Ordering::SeqCst), 0);
    }

    /// Fails the first relay attempt, as a bind on a busy port would.
    #[derive(Default)]
    struct FlakyRelay {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PortRelay for FlakyRelay {
        async fn relay(&self, _port: u16, cancel: CancellationToken) -> TunnelResult<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(TunnelError::Transport("address in use".into()));
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_relay_releases_the_port() {
        let relay = Arc::new(FlakyRelay::default());
        let fwd = PortForwarder::new(relay.clone(), Vec::new(), CancellationToken::new());

        fwd.forward("3000").await.unwrap();
        settle().await;
        assert!(fwd.active_ports().is_empty());

        fwd.forward("3000").await.unwrap();
        settle().await;
        assert_eq!(relay.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(fwd.active_ports(), vec!["3000".to_string()]);
    }

    #[tokio::test]
    async fn rejects_non_numeric_port() {
        let fwd = forwarder(Arc::new(CountingRelay::default()), &[]);
        let err = fwd.forward("http").await.unwrap_err();
        assert_eq!(err.code(), devtun_core::Code::Protocol);
    }
}
