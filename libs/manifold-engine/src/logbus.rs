//! Internal log bus.
//!
//! A `tracing` layer publishes formatted events onto a process-wide bus.
//! When the configuration binds producers to the internal log stream, the
//! coordinator attaches a [`LogBusConsumer`] that drains the bus into the
//! pipeline; unattached, `publish` is a no-op and the regular fmt layer
//! keeps writing to stderr.

use std::fmt::Write as _;
use std::sync::LazyLock;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use manifold_api::config::PluginConfigReader;
use manifold_api::error::PluginError;
use manifold_api::metadata::Metadata;
use manifold_api::plugin::{ConsumerContext, ConsumerPlugin};
use manifold_api::stream::StreamId;

struct LogBus {
    sender: parking_lot::RwLock<Option<mpsc::Sender<Vec<u8>>>>,
}

static BUS: LazyLock<LogBus> = LazyLock::new(|| LogBus {
    sender: parking_lot::RwLock::new(None),
});

/// Attach a drain to the bus, replacing any previous one.
pub fn attach(capacity: usize) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(capacity);
    *BUS.sender.write() = Some(tx);
    rx
}

pub fn detach() {
    *BUS.sender.write() = None;
}

/// Publish one log line. Returns `false` when no drain is attached or the
/// bus is full — the caller falls back to its own writer.
pub fn publish(line: Vec<u8>) -> bool {
    let guard = BUS.sender.read();
    match guard.as_ref() {
        Some(tx) => tx.try_send(line).is_ok(),
        None => false,
    }
}

pub fn is_attached() -> bool {
    BUS.sender.read().is_some()
}

// ---------------------------------------------------------------------------
// tracing layer
// ---------------------------------------------------------------------------

/// Layer forwarding formatted events to the bus. Stack it next to the fmt
/// layer; it stays silent while nothing is attached.
#[derive(Default)]
pub struct LogBusLayer;

impl<S> tracing_subscriber::Layer<S> for LogBusLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if !is_attached() {
            return;
        }

        let mut line = String::new();
        let meta = event.metadata();
        let _ = write!(line, "{} {}: ", meta.level(), meta.target());

        let mut visitor = LineVisitor {
            line: &mut line,
            first: true,
        };
        event.record(&mut visitor);

        publish(line.into_bytes());
    }
}

struct LineVisitor<'a> {
    line: &'a mut String,
    first: bool,
}

impl LineVisitor<'_> {
    fn sep(&mut self) {
        if !self.first {
            self.line.push(' ');
        }
        self.first = false;
    }
}

impl tracing::field::Visit for LineVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.sep();
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?}");
        } else {
            let _ = write!(self.line, "{}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.sep();
        if field.name() == "message" {
            self.line.push_str(value);
        } else {
            let _ = write!(self.line, "{}={value}", field.name());
        }
    }
}

// ---------------------------------------------------------------------------
// Internal log consumer
// ---------------------------------------------------------------------------

/// Consumer draining the log bus into the internal log stream, so log
/// lines flow through the pipeline like any other traffic.
pub struct LogBusConsumer {
    capacity: usize,
}

pub fn new_log_consumer() -> Box<dyn ConsumerPlugin> {
    Box::new(LogBusConsumer { capacity: 4096 })
}

#[async_trait]
impl ConsumerPlugin for LogBusConsumer {
    fn configure(&mut self, reader: &mut PluginConfigReader<'_>) {
        self.capacity = reader.get_int("Channel", 4096).max(1) as usize;
    }

    async fn run(
        &self,
        ctx: ConsumerContext,
        cancel: CancellationToken,
    ) -> Result<(), PluginError> {
        let mut rx = attach(self.capacity);

        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        ctx.emit_to(StreamId::INTERNAL_LOG, line, Metadata::new()).await;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        // Flush whatever the bus still holds before detaching.
        detach();
        while let Ok(line) = rx.try_recv() {
            ctx.emit_to(StreamId::INTERNAL_LOG, line, Metadata::new()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One combined test: the bus is process-global, so attach/detach
    // cycles must not interleave across test threads.
    #[tokio::test]
    async fn bus_round_trip_and_detach() {
        detach();
        assert!(!publish(b"nobody listening".to_vec()));

        let mut rx = attach(4);
        assert!(is_attached());
        assert!(publish(b"line one".to_vec()));
        assert_eq!(rx.recv().await.unwrap(), b"line one");

        // A full bus refuses instead of blocking the logger.
        for _ in 0..4 {
            publish(b"fill".to_vec());
        }
        assert!(!publish(b"overflow".to_vec()));

        detach();
        assert!(!publish(b"after detach".to_vec()));
    }
}
