//! Running a tunnel server over one pipe pair.

use devtun_core::rpc::RpcServer;
use devtun_core::{
    ConnectionCounter, DevcontainerResult, StdioListener, Tunnel, TunnelResult, TunnelService,
};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Holds the last result delivered through `SendResult`.
///
/// Written by the serving task, read by the orchestrator after the session
/// has ended.
#[derive(Debug, Clone, Default)]
pub struct ResultSlot(Arc<Mutex<Option<DevcontainerResult>>>);

impl ResultSlot {
    /// Parse and store `text`. A parse failure leaves the previous result.
    pub fn store(&self, text: &str) -> TunnelResult<()> {
        let parsed = DevcontainerResult::parse(text)?;
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(parsed);
        Ok(())
    }

    pub fn get(&self) -> Option<DevcontainerResult> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A server variant that captures the session result.
pub trait CapturesResult {
    fn result_slot(&self) -> &ResultSlot;
}

/// Serve `server` over `reader`/`writer` until `cancel` fires.
///
/// Returns `Ok` when cancelled, or the transport error that stopped the
/// server.
pub async fn serve_tunnel<T, R, W>(
    cancel: &CancellationToken,
    reader: R,
    writer: W,
    server: Arc<T>,
) -> TunnelResult<()>
where
    T: Tunnel + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let listener = StdioListener::from_pipes(reader, writer, false);
    RpcServer::new(Arc::new(TunnelService::new(server)))
        .serve(listener, cancel.child_token())
        .await
}

/// Like [`serve_tunnel`], then hand back whatever result was stored.
pub async fn run_with_result<T, R, W>(
    cancel: &CancellationToken,
    reader: R,
    writer: W,
    server: Arc<T>,
) -> TunnelResult<Option<DevcontainerResult>>
where
    T: Tunnel + CapturesResult + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let slot = server.result_slot().clone();
    serve_tunnel(cancel, reader, writer, server).await?;
    let result = slot.get();
    debug!(has_result = result.is_some(), "tunnel session finished");
    Ok(result)
}

/// Serve `server` on this process's own stdio. See [`serve_pipes`].
pub async fn serve_stdio<T>(
    cancel: &CancellationToken,
    server: Arc<T>,
    counter: Option<ConnectionCounter>,
) -> TunnelResult<()>
where
    T: Tunnel + 'static,
{
    serve_pipes(cancel, tokio::io::stdin(), tokio::io::stdout(), server, counter).await
}

/// Serve `server` as the process's one session.
///
/// Without a counter the process exits as soon as the peer closes the
/// pipes. With one, the session ending only drops the count, and the
/// counter's timeout decides when to stop; its callback is expected to
/// cancel `cancel`.
pub async fn serve_pipes<T, R, W>(
    cancel: &CancellationToken,
    reader: R,
    writer: W,
    server: Arc<T>,
    counter: Option<ConnectionCounter>,
) -> TunnelResult<()>
where
    T: Tunnel + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let listener = StdioListener::from_pipes(reader, writer, counter.is_none());
    let mut rpc = RpcServer::new(Arc::new(TunnelService::new(server)));
    if let Some(counter) = counter {
        rpc = rpc.with_counter(counter);
    }
    rpc.serve(listener, cancel.child_token()).await
}
