//! Connection emulation over a pair of already-connected byte pipes.
//!
//! [`StdioStream`] joins a reader and a writer into one duplex connection,
//! and [`StdioListener`] hands that connection to an accept loop exactly once.
//! Deadlines are not supported: to abort blocked I/O, close the stream or
//! cancel the task that owns it.

use crate::error::{TunnelError, TunnelResult};
use crate::transport::{Connection, Listener};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Process exit code used when an exit-on-close stream is closed.
pub const EXIT_CODE_IO: i32 = 64;

/// In-memory pipe buffer size.
const PIPE_CAPACITY: usize = 64 * 1024;

pub type PipeReader = ReadHalf<DuplexStream>;
pub type PipeWriter = WriteHalf<DuplexStream>;

/// Create a one-directional in-memory pipe.
///
/// Bytes written to the writer come out of the reader. Dropping or shutting
/// down the writer gives the reader EOF; dropping the reader makes writes fail.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let (reader, _) = tokio::io::split(near);
    let (_, writer) = tokio::io::split(far);
    (reader, writer)
}

/// A duplex connection made from a byte source and a byte sink.
pub struct StdioStream<R, W> {
    reader: R,
    writer: W,
    exit_on_close: bool,
}

impl<R, W> StdioStream<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// When `exit_on_close` is set, closing the stream terminates the process.
    /// Use it only when the pipes are this process's own stdin/stdout.
    pub fn new(reader: R, writer: W, exit_on_close: bool) -> Self {
        Self {
            reader,
            writer,
            exit_on_close,
        }
    }

    pub fn local_addr(&self) -> &'static str {
        "local"
    }

    pub fn remote_addr(&self) -> &'static str {
        "remote"
    }

    /// Deadlines are ignored.
    pub fn set_deadline(&self, _deadline: Option<Instant>) {}

    pub fn exit_on_close(&self) -> bool {
        self.exit_on_close
    }
}

impl StdioStream<tokio::io::Stdin, tokio::io::Stdout> {
    /// Wrap this process's stdin/stdout. Closing it exits the process.
    pub fn from_process() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), true)
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for StdioStream<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for StdioStream<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.exit_on_close {
            // The parent that owned our stdio is gone.
            debug!("stdio stream closed, exiting");
            std::process::exit(EXIT_CODE_IO);
        }
        Pin::new(&mut this.writer).poll_shutdown(cx)
    }
}

/// A listener that yields its one stream on the first accept and then
/// blocks forever.
pub struct StdioListener<C> {
    queue: Mutex<mpsc::Receiver<C>>,
    // Held so the queue never reports closed.
    _refill: mpsc::Sender<C>,
}

impl<C: Connection> StdioListener<C> {
    pub fn new(conn: C) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 and a fresh channel: this cannot fail.
        let _ = tx.try_send(conn);
        Self {
            queue: Mutex::new(rx),
            _refill: tx,
        }
    }
}

impl<R, W> StdioListener<StdioStream<R, W>>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn from_pipes(reader: R, writer: W, exit_on_close: bool) -> Self {
        Self::new(StdioStream::new(reader, writer, exit_on_close))
    }
}

impl<C: Connection> Listener for StdioListener<C> {
    type Conn = C;

    async fn accept(&self) -> TunnelResult<C> {
        self.queue
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TunnelError::Transport("listener closed".into()))
    }

    fn local_addr(&self) -> &str {
        "stdio"
    }
}
