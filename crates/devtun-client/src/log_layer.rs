//! Forwards local `tracing` events to the tunnel peer's log sink.

use devtun_core::{LogLevel, LogMessage, Tunnel};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Lines queued before new ones are dropped.
const LOG_QUEUE: usize = 256;

/// Targets never forwarded: the RPC layer logs while sending, which would loop.
const SKIPPED_TARGETS: &[&str] = &["devtun_core", "devtun_client"];

/// A [`Layer`] that ships events at or above `max_level` to the peer.
///
/// Sending never blocks the logging thread; lines are dropped when the
/// queue is full.
pub struct TunnelLogLayer {
    tx: mpsc::Sender<LogMessage>,
    max_level: Level,
}

impl TunnelLogLayer {
    /// Build the layer and spawn the task that drains it into `tunnel`.
    pub fn new(tunnel: Arc<dyn Tunnel>, debug: bool) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<LogMessage>(LOG_QUEUE);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if tunnel.log(message).await.is_err() {
                    break;
                }
            }
        });
        let max_level = if debug { Level::DEBUG } else { Level::INFO };
        (Self { tx, max_level }, handle)
    }
}

impl<S: Subscriber> Layer<S> for TunnelLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // more verbose levels compare greater
        if *meta.level() > self.max_level {
            return;
        }
        if SKIPPED_TARGETS.iter().any(|t| meta.target().starts_with(t)) {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let done = visitor.done;
        let log_level = if done {
            LogLevel::Done
        } else {
            match *meta.level() {
                Level::ERROR => LogLevel::Error,
                Level::WARN => LogLevel::Warning,
                Level::INFO => LogLevel::Info,
                _ => LogLevel::Debug,
            }
        };
        let _ = self.tx.try_send(LogMessage {
            log_level,
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct LineVisitor {
    line: String,
    fields: String,
    done: bool,
}

impl Visit for LineVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "done" {
            self.done = value;
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.line.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl LineVisitor {
    fn finish(mut self) -> String {
        self.line.push_str(&self.fields);
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use devtun_core::{
        ChunkStream, Message, MountRequest, PortRequest, TunnelError, TunnelResult,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct Sink {
        lines: Mutex<Vec<LogMessage>>,
    }

    fn unsupported<T>() -> TunnelResult<T> {
        Err(TunnelError::Unimplemented("sink".into()))
    }

    #[async_trait]
    impl Tunnel for Sink {
        async fn ping(&self) -> TunnelResult<()> {
            Ok(())
        }
        async fn log(&self, message: LogMessage) -> TunnelResult<()> {
            self.lines.lock().unwrap().push(message);
            Ok(())
        }
        async fn forward_port(&self, _: PortRequest) -> TunnelResult<()> {
            unsupported()
        }
        async fn stop_forward_port(&self, _: PortRequest) -> TunnelResult<()> {
            unsupported()
        }
        async fn docker_credentials(&self, _: Message) -> TunnelResult<Message> {
            unsupported()
        }
        async fn git_credentials(&self, _: Message) -> TunnelResult<Message> {
            unsupported()
        }
        async fn git_user(&self) -> TunnelResult<Message> {
            unsupported()
        }
        async fn git_ssh_signature(&self, _: Message) -> TunnelResult<Message> {
            unsupported()
        }
        async fn gpg_public_keys(&self) -> TunnelResult<Message> {
            unsupported()
        }
        async fn send_result(&self, _: Message) -> TunnelResult<()> {
            unsupported()
        }
        async fn stream_workspace(&self) -> TunnelResult<ChunkStream> {
            unsupported()
        }
        async fn stream_git_clone(&self) -> TunnelResult<ChunkStream> {
            unsupported()
        }
        async fn stream_mount(&self, _: MountRequest) -> TunnelResult<ChunkStream> {
            unsupported()
        }
    }

    #[tokio::test]
    async fn forwards_events_at_or_above_level() {
        let sink = Arc::new(Sink::default());
        let (layer, _handle) = TunnelLogLayer::new(sink.clone(), false);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "devtun", port = 3000, "forwarding port");
            tracing::debug!(target: "devtun", "hidden at info");
            tracing::warn!(target: "devtun_core::rpc", "rpc internals stay local");
            tracing::info!(target: "devtun", done = true, "workspace ready");
        });

        for _ in 0..50 {
            if sink.lines.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lines = sink.lines.lock().unwrap().clone();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].log_level, LogLevel::Info);
        assert_eq!(lines[0].message, "forwarding port port=3000");
        assert_eq!(lines[1].log_level, LogLevel::Done);
        assert_eq!(lines[1].message, "workspace ready");
    }
}
