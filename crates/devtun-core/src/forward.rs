use crate::error::TunnelResult;
use async_trait::async_trait;

/// Per-port forward lifecycle, consumed by the port watcher and the host
/// tunnel server. Ports are decimal strings as they appear on the wire.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, port: &str) -> TunnelResult<()>;

    async fn stop_forward(&self, port: &str) -> TunnelResult<()>;
}
