//! Consumer runtime — source-side scaffolding around a consumer plugin.
//!
//! The runtime resolves bound streams, builds the consumer-side modulator
//! chain into a [`ConsumerContext`], spawns the configured worker count,
//! and joins them at shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use manifold_api::config::{PluginConfig, PluginConfigReader};
use manifold_api::modulator::ModulatorChain;
use manifold_api::plugin::{ConsumerContext, ConsumerPlugin, PluginState, StateCell, StreamDispatch};
use manifold_api::stream::StreamId;

use crate::streams::{RegistryDispatch, StreamRegistry};

/// Settings every consumer shares, read from the instance config.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub streams: Vec<String>,
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub modulators: Vec<PluginConfig>,
}

impl ConsumerSettings {
    pub fn read(reader: &mut PluginConfigReader<'_>) -> Self {
        Self {
            streams: reader.get_string_list("Streams", &[]),
            workers: reader.get_int("Workers", 1).max(1) as usize,
            shutdown_timeout: reader.get_duration_ms("ShutdownTimeoutMs", Duration::from_secs(1)),
            modulators: reader.get_plugin_list("Modulators"),
        }
    }
}

/// Everything the coordinator needs to build a consumer runtime.
pub struct ConsumerSpec {
    pub name: String,
    pub streams: Vec<StreamId>,
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub chain: ModulatorChain,
}

pub struct ConsumerRuntime {
    name: String,
    plugin: Arc<dyn ConsumerPlugin>,
    streams: Arc<[StreamId]>,
    chain: Arc<ModulatorChain>,
    workers: usize,
    shutdown_timeout: Duration,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ConsumerRuntime {
    pub fn new(spec: ConsumerSpec, plugin: Box<dyn ConsumerPlugin>) -> Self {
        Self {
            name: spec.name,
            plugin: Arc::from(plugin),
            streams: Arc::from(spec.streams.into_boxed_slice()),
            chain: Arc::new(spec.chain),
            workers: spec.workers,
            shutdown_timeout: spec.shutdown_timeout,
            state: Arc::new(StateCell::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &StateCell {
        &self.state
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Spawn the worker pool. Each worker runs the plugin's ingest loop
    /// with a clone of the emit context.
    pub fn start(&self, registry: &Arc<StreamRegistry>, panic_tx: mpsc::UnboundedSender<String>) {
        let dispatch: Arc<dyn StreamDispatch> = Arc::new(RegistryDispatch(registry.clone()));
        let ctx = ConsumerContext::new(self.streams.clone(), self.chain.clone(), dispatch);

        for _ in 0..self.workers {
            let plugin = self.plugin.clone();
            let ctx = ctx.clone();
            let cancel = self.cancel.clone();
            let name = self.name.clone();
            let join = self.tracker.spawn(async move {
                if let Err(e) = plugin.run(ctx, cancel).await {
                    tracing::error!(consumer = %name, error = %e, "consumer worker failed");
                }
            });
            tokio::spawn(supervise(join, self.name.clone(), panic_tx.clone()));
        }
        self.tracker.close();
        self.state.set(PluginState::Active);
        tracing::info!(consumer = %self.name, workers = self.workers, "consumer started");
    }

    /// Invoke the plugin's roll callback (exactly once per signal).
    pub async fn roll(&self) {
        if let Err(e) = self.plugin.on_roll().await {
            tracing::error!(consumer = %self.name, error = %e, "roll failed");
        }
    }

    /// Cancel the ingest loops and wait for the workers, up to ten times
    /// the declared shutdown timeout. Returns `false` on stragglers.
    pub async fn stop(&self) -> bool {
        self.state.set(PluginState::Stopping);
        self.cancel.cancel();

        let deadline = Instant::now() + self.shutdown_timeout * 10;
        let joined = tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_ok();
        if joined {
            self.state.set(PluginState::Dead);
            tracing::info!(consumer = %self.name, "consumer stopped");
        } else {
            tracing::warn!(consumer = %self.name, "consumer workers exceeded shutdown timeout");
        }
        joined
    }
}

impl std::fmt::Debug for ConsumerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRuntime")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .finish()
    }
}

async fn supervise(join: JoinHandle<()>, name: String, panic_tx: mpsc::UnboundedSender<String>) {
    if let Err(e) = join.await {
        if e.is_panic() {
            tracing::error!(consumer = %name, error = %e, "worker panicked");
            let _ = panic_tx.send(name);
        }
    }
}
