use super::{write_loop, OUTGOING_QUEUE, READ_BUF_LEN};
use crate::codec::{from_value, to_value, FrameDecoder};
use crate::error::{TunnelError, TunnelResult};
use crate::messages::{CallId, Frame};
use crate::transport::Connection;
use ciborium::Value;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered items per open stream before the reader applies backpressure.
const STREAM_QUEUE: usize = 32;

enum Pending {
    Unary(oneshot::Sender<TunnelResult<Value>>),
    Stream(mpsc::Sender<TunnelResult<Value>>),
}

#[derive(Default)]
struct Calls {
    pending: HashMap<CallId, Pending>,
    /// Set once the read side is gone; new calls fail immediately.
    closed: Option<String>,
}

type SharedCalls = Arc<Mutex<Calls>>;

/// Caller side of one RPC connection.
pub struct RpcClient {
    outgoing: mpsc::Sender<Frame>,
    calls: SharedCalls,
    next_id: AtomicU64,
    closed: CancellationToken,
    read_handle: JoinHandle<()>,
}

impl RpcClient {
    /// Start the reader and writer pumps for `conn`. Must be called from
    /// within a tokio runtime.
    pub fn new<C: Connection>(conn: C) -> Self {
        let (reader, writer) = tokio::io::split(conn);
        let (outgoing, outgoing_rx) = mpsc::channel::<Frame>(OUTGOING_QUEUE);
        let calls: SharedCalls = Arc::new(Mutex::new(Calls::default()));
        let closed = CancellationToken::new();

        tokio::spawn(async move {
            if let Err(e) = write_loop(writer, outgoing_rx).await {
                debug!(error = %e, "rpc client writer ended");
            }
        });

        let read_handle = {
            let calls = calls.clone();
            let weak = outgoing.downgrade();
            let closed = closed.clone();
            tokio::spawn(async move {
                Self::read_loop(reader, calls, weak).await;
                closed.cancel();
            })
        };

        Self {
            outgoing,
            calls,
            next_id: AtomicU64::new(1),
            closed,
            read_handle,
        }
    }

    /// Resolves once the peer has gone away.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Make a unary call.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> TunnelResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = to_value(request)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.register(id, Pending::Unary(tx)).await?;
        self.send_request(id, method, body).await?;

        let value = rx
            .await
            .map_err(|_| TunnelError::Transport("connection closed".into()))??;
        from_value(&value)
    }

    /// Make a server-streaming call. Dropping the returned stream cancels
    /// the call on the server.
    pub async fn call_stream<Req, Item>(
        &self,
        method: &str,
        request: &Req,
    ) -> TunnelResult<BoxStream<'static, TunnelResult<Item>>>
    where
        Req: Serialize,
        Item: DeserializeOwned + Send + 'static,
    {
        let body = to_value(request)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.register(id, Pending::Stream(tx)).await?;
        self.send_request(id, method, body).await?;

        Ok(ReceiverStream::new(rx)
            .map(|item| item.and_then(|value| from_value(&value)))
            .boxed())
    }

    async fn register(&self, id: CallId, pending: Pending) -> TunnelResult<()> {
        let mut calls = self.calls.lock().await;
        if let Some(reason) = &calls.closed {
            return Err(TunnelError::Transport(reason.clone()));
        }
        calls.pending.insert(id, pending);
        Ok(())
    }

    async fn send_request(&self, id: CallId, method: &str, body: Value) -> TunnelResult<()> {
        let frame = Frame::Request {
            id,
            method: method.to_string(),
            body,
        };
        if self.outgoing.send(frame).await.is_err() {
            self.calls.lock().await.pending.remove(&id);
            return Err(TunnelError::Transport("connection closed".into()));
        }
        Ok(())
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        mut reader: R,
        calls: SharedCalls,
        outgoing: mpsc::WeakSender<Frame>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUF_LEN];

        let reason = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break "connection closed".to_string(),
                Ok(n) => n,
                Err(e) => break format!("read failed: {e}"),
            };
            let frames: Vec<Frame> = match decoder.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => break e.to_string(),
            };
            for frame in frames {
                Self::deliver(frame, &calls, &outgoing).await;
            }
        };
        debug!(reason = %reason, "rpc client read loop ended");

        let drained: Vec<Pending> = {
            let mut calls = calls.lock().await;
            calls.closed = Some(reason.clone());
            calls.pending.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            let err = TunnelError::Transport(reason.clone());
            match pending {
                Pending::Unary(tx) => {
                    let _ = tx.send(Err(err));
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        }
    }

    async fn deliver(frame: Frame, calls: &SharedCalls, outgoing: &mpsc::WeakSender<Frame>) {
        match frame {
            Frame::Response { id, body } => {
                let entry = calls.lock().await.pending.remove(&id);
                if let Some(Pending::Unary(tx)) = entry {
                    let _ = tx.send(Ok(body));
                }
            }
            Frame::Item { id, body } => {
                let tx = {
                    let calls = calls.lock().await;
                    match calls.pending.get(&id) {
                        Some(Pending::Stream(tx)) => Some(tx.clone()),
                        _ => None,
                    }
                };
                let Some(tx) = tx else { return };
                if tx.send(Ok(body)).await.is_err() {
                    // consumer dropped the stream
                    calls.lock().await.pending.remove(&id);
                    if let Some(out) = outgoing.upgrade() {
                        let _ = out.send(Frame::Cancel { id }).await;
                    }
                }
            }
            Frame::End { id } => {
                calls.lock().await.pending.remove(&id);
            }
            Frame::Error { id, status } => {
                let entry = calls.lock().await.pending.remove(&id);
                match entry {
                    Some(Pending::Unary(tx)) => {
                        let _ = tx.send(Err(status.into()));
                    }
                    Some(Pending::Stream(tx)) => {
                        let _ = tx.send(Err(status.into())).await;
                    }
                    None => debug!(id, "error for unknown call"),
                }
            }
            other => warn!(id = other.id(), "unexpected frame from server"),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.read_handle.abort();
    }
}
