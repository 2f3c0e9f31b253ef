use async_trait::async_trait;
use devtun_core::{Forwarder, PortRequest, Tunnel, TunnelResult};
use std::sync::Arc;

/// Forwarder that asks the tunnel peer to forward ports on our behalf.
///
/// Used inside the container, where the watcher sees a port open and the
/// host end owns the actual listener.
pub struct RemoteForwarder {
    tunnel: Arc<dyn Tunnel>,
}

impl RemoteForwarder {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> Self {
        Self { tunnel }
    }
}

#[async_trait]
impl Forwarder for RemoteForwarder {
    async fn forward(&self, port: &str) -> TunnelResult<()> {
        self.tunnel.forward_port(PortRequest::new(port)).await
    }

    async fn stop_forward(&self, port: &str) -> TunnelResult<()> {
        self.tunnel.stop_forward_port(PortRequest::new(port)).await
    }
}
