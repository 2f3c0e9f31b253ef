//! A small request/response + server-streaming RPC framework over any
//! [`Connection`], framed with the CBOR codec.
//!
//! Each call carries a client-assigned id so calls on one connection run
//! concurrently. A unary call is answered with `Response` or `Error`; a
//! streaming call with any number of `Item`s followed by `End` or `Error`.

mod client;
mod server;

pub use client::RpcClient;
pub use server::{Dispatch, Reply, RpcServer};

use crate::codec::frame_encode;
use crate::error::TunnelResult;
use crate::messages::Frame;
use crate::transport::Connection;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;

/// Read buffer size for connection pumps.
pub(crate) const READ_BUF_LEN: usize = 16 * 1024;

/// Outgoing frame queue depth.
pub(crate) const OUTGOING_QUEUE: usize = 64;

/// Drain `frames` onto the connection, then shut its write side down.
pub(crate) async fn write_loop<C: Connection>(
    mut writer: WriteHalf<C>,
    mut frames: mpsc::Receiver<Frame>,
) -> TunnelResult<()> {
    while let Some(frame) = frames.recv().await {
        let bytes = frame_encode(&frame)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}
