//! An [`AsyncWrite`] sink that turns helper output into log lines.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tracing::{debug, error, info, trace, warn, Level};

/// Splits written bytes on newlines and emits each line at `level`.
/// A trailing partial line is emitted on shutdown or drop.
pub struct LogWriter {
    level: Level,
    pending: Vec<u8>,
}

impl LogWriter {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            pending: Vec::new(),
        }
    }

    /// Append `buf` and return the lines it completed.
    fn push(&mut self, buf: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(buf);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode(&line));
        }
        lines
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode(&rest))
    }

    fn emit(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        if self.level == Level::ERROR {
            error!(target: "devtun::helper", "{line}");
        } else if self.level == Level::WARN {
            warn!(target: "devtun::helper", "{line}");
        } else if self.level == Level::INFO {
            info!(target: "devtun::helper", "{line}");
        } else if self.level == Level::DEBUG {
            debug!(target: "devtun::helper", "{line}");
        } else {
            trace!(target: "devtun::helper", "{line}");
        }
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

impl AsyncWrite for LogWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        for line in this.push(buf) {
            this.emit(&line);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(rest) = this.take_rest() {
            this.emit(&rest);
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Some(rest) = self.take_rest() {
            self.emit(&rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn splits_lines_across_writes() {
        let mut writer = LogWriter::new(Level::INFO);
        assert!(writer.push(b"hel").is_empty());
        assert_eq!(writer.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(writer.push(b"ld\r\n\n"), vec!["world", ""]);
        assert!(writer.take_rest().is_none());
    }

    #[test]
    fn keeps_partial_line() {
        let mut writer = LogWriter::new(Level::DEBUG);
        writer.push(b"no newline");
        assert_eq!(writer.take_rest().as_deref(), Some("no newline"));
        assert!(writer.take_rest().is_none());
    }

    #[tokio::test]
    async fn accepts_all_bytes() {
        let mut writer = LogWriter::new(Level::WARN);
        writer.write_all(b"one\ntwo\nthree").await.unwrap();
        writer.shutdown().await.unwrap();
        assert!(writer.take_rest().is_none());
    }
}
