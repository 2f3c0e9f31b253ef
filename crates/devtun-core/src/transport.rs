//! Connection-level abstractions the RPC layer runs on.

use crate::error::TunnelResult;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};

/// A full-duplex byte connection.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

/// Source of inbound connections for [`crate::rpc::RpcServer`].
pub trait Listener: Send + Sync {
    type Conn: Connection;

    /// Wait for the next connection.
    fn accept(&self) -> impl Future<Output = TunnelResult<Self::Conn>> + Send;

    /// Opaque address token.
    fn local_addr(&self) -> &str;

    fn close(&self) {}
}
