use super::{write_loop, OUTGOING_QUEUE, READ_BUF_LEN};
use crate::codec::FrameDecoder;
use crate::counter::ConnectionCounter;
use crate::error::{Status, TunnelResult};
use crate::messages::{CallId, Frame};
use crate::transport::{Connection, Listener};
use async_trait::async_trait;
use ciborium::Value;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a dispatched call answers with.
pub enum Reply {
    Unary(Value),
    Stream(BoxStream<'static, TunnelResult<Value>>),
}

/// Routes a method name and request body to an implementation.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, body: Value) -> TunnelResult<Reply>;
}

/// Accept loop serving every connection from a [`Listener`].
pub struct RpcServer<D> {
    dispatch: Arc<D>,
    counter: Option<ConnectionCounter>,
}

impl<D: Dispatch> RpcServer<D> {
    pub fn new(dispatch: Arc<D>) -> Self {
        Self {
            dispatch,
            counter: None,
        }
    }

    /// Bracket every served connection with `add`/`dec` on `counter`.
    pub fn with_counter(mut self, counter: ConnectionCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Serve until `shutdown` fires (returns `Ok`) or accepting fails.
    ///
    /// A connection that ends does not stop the server; with a
    /// [`StdioListener`](crate::stdio::StdioListener) the loop then simply
    /// waits for the governing cancellation.
    pub async fn serve<L: Listener>(
        &self,
        listener: L,
        shutdown: CancellationToken,
    ) -> TunnelResult<()> {
        debug!(addr = listener.local_addr(), "rpc server listening");
        let mut connections = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(e) => break Err(e),
                    };
                    let dispatch = self.dispatch.clone();
                    let counter = self.counter.clone();
                    let token = shutdown.child_token();
                    connections.spawn(async move {
                        if let Some(counter) = &counter {
                            counter.add();
                        }
                        let result = serve_connection(conn, dispatch, token).await;
                        if let Some(counter) = &counter {
                            counter.dec();
                        }
                        result
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    match joined {
                        Ok(Ok(())) => debug!("connection closed"),
                        Ok(Err(e)) => debug!(error = %e, "connection ended with error"),
                        Err(e) => warn!(error = %e, "connection task failed"),
                    }
                }
            }
        };

        listener.close();
        connections.shutdown().await;
        result
    }
}

async fn serve_connection<C: Connection, D: Dispatch>(
    conn: C,
    dispatch: Arc<D>,
    shutdown: CancellationToken,
) -> TunnelResult<()> {
    let (mut reader, writer) = tokio::io::split(conn);
    let (out_tx, out_rx) = mpsc::channel::<Frame>(OUTGOING_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let mut calls: JoinSet<CallId> = JoinSet::new();
    let mut handles: HashMap<CallId, AbortHandle> = HashMap::new();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_LEN];

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            Some(done) = calls.join_next(), if !calls.is_empty() => {
                if let Ok(id) = done {
                    handles.remove(&id);
                }
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                let frames: Vec<Frame> = match decoder.feed(&buf[..n]) {
                    Ok(frames) => frames,
                    Err(e) => break Err(e),
                };
                for frame in frames {
                    match frame {
                        Frame::Request { id, method, body } => {
                            let dispatch = dispatch.clone();
                            let out = out_tx.clone();
                            let handle = calls.spawn(async move {
                                run_call(dispatch.as_ref(), id, &method, body, &out).await;
                                id
                            });
                            handles.insert(id, handle);
                        }
                        Frame::Cancel { id } => {
                            if let Some(handle) = handles.remove(&id) {
                                debug!(id, "call cancelled by peer");
                                handle.abort();
                            }
                        }
                        other => warn!(id = other.id(), "unexpected frame from client"),
                    }
                }
            }
        }
    };

    calls.shutdown().await;
    drop(out_tx);
    match writer_task.await {
        Ok(Err(e)) => debug!(error = %e, "writer ended with error"),
        Err(e) => warn!(error = %e, "writer task failed"),
        Ok(Ok(())) => {}
    }
    result
}

async fn run_call<D: Dispatch>(
    dispatch: &D,
    id: CallId,
    method: &str,
    body: Value,
    out: &mpsc::Sender<Frame>,
) {
    debug!(id, method, "call");
    let reply = match dispatch.dispatch(method, body).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(id, method, error = %e, "call failed");
            let _ = out.send(Frame::Error { id, status: Status::from(&e) }).await;
            return;
        }
    };

    match reply {
        Reply::Unary(body) => {
            let _ = out.send(Frame::Response { id, body }).await;
        }
        Reply::Stream(mut items) => {
            while let Some(item) = items.next().await {
                let frame = match item {
                    Ok(body) => Frame::Item { id, body },
                    Err(e) => {
                        debug!(id, method, error = %e, "stream failed");
                        let _ = out.send(Frame::Error { id, status: Status::from(&e) }).await;
                        return;
                    }
                };
                if out.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = out.send(Frame::End { id }).await;
        }
    }
}
