//! Profiler consumer — synthetic message generator.
//!
//! Emits a configurable number of padded template messages to its bound
//! streams, optionally forever, and reports the achieved rate. Useful for
//! load-testing a pipeline without any external source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use manifold_api::config::{ConfigValue, PluginConfigReader};
use manifold_api::error::PluginError;
use manifold_api::metadata::{Metadata, MetadataValue};
use manifold_api::plugin::{ConsumerContext, ConsumerPlugin};

pub struct ProfilerConsumer {
    runs: u64,
    template: String,
    size: usize,
    delay: Duration,
    keep_running: bool,
    /// Static fields stamped onto every emitted message.
    metadata: Metadata,
    emitted: AtomicU64,
}

impl Default for ProfilerConsumer {
    fn default() -> Self {
        Self {
            runs: 10_000,
            template: "profiler message %d".to_string(),
            size: 256,
            delay: Duration::ZERO,
            keep_running: false,
            metadata: Metadata::new(),
            emitted: AtomicU64::new(0),
        }
    }
}

fn to_metadata_value(value: &ConfigValue) -> MetadataValue {
    match value {
        ConfigValue::Bool(v) => MetadataValue::Bool(*v),
        ConfigValue::Int(v) => MetadataValue::Int(*v),
        ConfigValue::Float(v) => MetadataValue::Float(*v),
        ConfigValue::Str(v) => MetadataValue::Str(v.clone()),
        ConfigValue::List(items) => {
            MetadataValue::List(items.iter().map(to_metadata_value).collect())
        }
        ConfigValue::Map(entries) => MetadataValue::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), to_metadata_value(v)))
                .collect(),
        ),
    }
}

impl ProfilerConsumer {
    /// Template with `%d` replaced by the sequence number, padded with
    /// dots up to the configured size.
    fn render(&self, seq: u64) -> Vec<u8> {
        let mut payload = self
            .template
            .replace("%d", &seq.to_string())
            .into_bytes();
        if payload.len() < self.size {
            payload.resize(self.size, b'.');
        }
        payload
    }

    /// Messages emitted so far, across all workers.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConsumerPlugin for ProfilerConsumer {
    fn configure(&mut self, reader: &mut PluginConfigReader<'_>) {
        self.runs = reader.get_int("Runs", 10_000).max(0) as u64;
        self.template = reader.get_str("Message", "profiler message %d");
        self.size = reader.get_int("Size", 256).max(0) as usize;
        self.delay = reader.get_duration_ms("DelayMs", Duration::ZERO);
        self.keep_running = reader.get_bool("KeepRunning", false);
        self.metadata = reader
            .get_map("Metadata")
            .iter()
            .map(|(key, value)| (key.clone(), to_metadata_value(value)))
            .collect();
    }

    async fn run(
        &self,
        ctx: ConsumerContext,
        cancel: CancellationToken,
    ) -> Result<(), PluginError> {
        let start = Instant::now();
        let mut count = 0u64;

        while (self.keep_running || count < self.runs) && !cancel.is_cancelled() {
            let payload = self.render(count);
            ctx.emit(payload, self.metadata.clone()).await;
            count += 1;
            self.emitted.fetch_add(1, Ordering::Relaxed);

            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { count as f64 / elapsed } else { 0.0 };
        tracing::info!(messages = count, rate = %format!("{rate:.0}/s"), "profiler finished");
        Ok(())
    }
}

/// Register the profiler under its qualified type name.
pub fn register() {
    manifold_engine::registry::register_consumer("manifold.consumer.Profiler", || {
        Box::new(ProfilerConsumer::default())
    });
}
