//! File producer — batched writer with rotation support.
//!
//! Payloads are framed with a trailing newline, coalesced in a
//! double-buffered batch, and flushed on size or time thresholds. A ROLL
//! command flushes and reopens the file handle, so external logrotate
//! works the usual way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use manifold_api::config::PluginConfigReader;
use manifold_api::error::{PluginError, SinkError};
use manifold_api::message::Message;
use manifold_api::metrics::{Metric, MetricsProvider};
use manifold_api::plugin::ProducerPlugin;
use manifold_engine::batch::{AppendResult, MessageBatch};
use manifold_engine::metric_names;

pub struct FileProducer {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    batch: MessageBatch,
    flush_at_bytes: usize,
    flush_interval: Duration,
    /// Set by the stop callback; makes the drain phase write-through so no
    /// trailing bytes are left behind.
    closing: bool,
    m_discarded: Option<Arc<dyn Metric>>,
}

impl Default for FileProducer {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
            batch: MessageBatch::new(32 * 1024),
            flush_at_bytes: 16 * 1024,
            flush_interval: Duration::from_secs(1),
            closing: false,
            m_discarded: None,
        }
    }
}

impl FileProducer {
    async fn ensure_open(&mut self) -> std::io::Result<()> {
        if self.file.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            tracing::debug!(path = %self.path.display(), "file opened");
            self.file = Some(file);
        }
        Ok(())
    }

    async fn flush_batch(&mut self) -> std::io::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.ensure_open().await?;
        let path = self.path.clone();
        let file = self.file.as_mut().expect("opened above");

        let ok = self
            .batch
            .flush(|data| {
                Box::pin(async move {
                    let result = async {
                        file.write_all(&data).await?;
                        file.flush().await
                    }
                    .await;
                    match result {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::error!(path = %path.display(), error = %e, "file write failed");
                            false
                        }
                    }
                })
            })
            .await;

        if ok {
            Ok(())
        } else {
            Err(std::io::Error::other("batch flush failed"))
        }
    }
}

#[async_trait]
impl ProducerPlugin for FileProducer {
    fn configure(&mut self, reader: &mut PluginConfigReader<'_>) {
        self.path = PathBuf::from(reader.require_str("Path"));
        let capacity = reader.get_int("BatchSizeByte", 32 * 1024).max(64) as usize;
        self.batch = MessageBatch::new(capacity);
        self.flush_at_bytes = reader
            .get_int("FlushAfterBytes", (capacity / 2) as i64)
            .max(1) as usize;
        self.flush_interval =
            reader.get_duration_ms("FlushIntervalMs", Duration::from_secs(1));
    }

    fn attach_metrics(&mut self, metrics: Arc<dyn MetricsProvider>) {
        self.m_discarded = Some(metrics.metric(metric_names::DISCARDED));
    }

    async fn on_message(&mut self, msg: &Message) -> Result<(), SinkError> {
        let mut record = Vec::with_capacity(msg.payload.len() + 1);
        record.extend_from_slice(&msg.payload);
        record.push(b'\n');

        match self.batch.append(&record) {
            AppendResult::Appended => {}
            AppendResult::Full => {
                self.flush_batch().await.map_err(SinkError::transient)?;
                if self.batch.append(&record) != AppendResult::Appended {
                    return Err(SinkError::transient("batch still full after flush"));
                }
            }
            AppendResult::TooLarge => {
                tracing::warn!(
                    path = %self.path.display(),
                    bytes = record.len(),
                    "record exceeds batch capacity, discarding"
                );
                if let Some(m) = &self.m_discarded {
                    m.inc();
                }
                return Ok(());
            }
        }

        if self.closing || self.batch.reached_size_threshold(self.flush_at_bytes) {
            if let Err(e) = self.flush_batch().await {
                // The record is safely batched; the next flush retries.
                tracing::warn!(path = %self.path.display(), error = %e, "flush deferred");
            }
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), PluginError> {
        if self.batch.reached_time_threshold(self.flush_interval)
            || self.batch.reached_size_threshold(self.flush_at_bytes)
        {
            self.flush_batch().await?;
        }
        Ok(())
    }

    async fn on_roll(&mut self) -> Result<(), PluginError> {
        self.flush_batch().await?;
        self.file = None;
        tracing::info!(path = %self.path.display(), "file rotated");
        Ok(())
    }

    async fn on_stop(&mut self) -> Result<(), PluginError> {
        self.closing = true;
        self.flush_batch().await?;
        self.batch.wait_for_flush().await;
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.flush_interval)
    }
}

/// Register the file producer under its qualified type name.
pub fn register() {
    manifold_engine::registry::register_producer("manifold.producer.File", || {
        Box::new(FileProducer::default())
    });
}
