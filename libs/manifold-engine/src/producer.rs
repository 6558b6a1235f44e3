//! Producer runtime — the sink-side scaffolding around a producer plugin.
//!
//! The runtime owns the inbound channel, the control channel, the worker
//! pool, the modulator chains, the optional fuse, and shutdown handling.
//! The plugin only implements dispatch (`on_message`, `on_tick`,
//! `on_roll`, `on_stop`).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use manifold_api::config::{PluginConfig, PluginConfigReader};
use manifold_api::fuse::Fuse;
use manifold_api::message::Message;
use manifold_api::metrics::Metric;
use manifold_api::modulator::{ModulateResult, ModulatorChain};
use manifold_api::plugin::{ControlCommand, PluginState, ProducerPlugin, StateCell};
use manifold_api::stream::{FALLBACK_STREAM, StreamId};

use crate::metric_names;
use crate::streams::StreamRegistry;

/// Enqueue timeout regime. Zero blocks forever, negative drops after one
/// attempt, positive waits that long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    Block,
    Immediate,
    After(Duration),
}

impl TimeoutPolicy {
    pub fn from_ms(ms: i64) -> Self {
        match ms {
            0 => TimeoutPolicy::Block,
            ms if ms < 0 => TimeoutPolicy::Immediate,
            ms => TimeoutPolicy::After(Duration::from_millis(ms as u64)),
        }
    }
}

// ---------------------------------------------------------------------------
// Common settings
// ---------------------------------------------------------------------------

/// Settings every producer shares, read from the instance config.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub streams: Vec<String>,
    pub channel_capacity: usize,
    pub channel_timeout: TimeoutPolicy,
    pub shutdown_timeout: Duration,
    pub workers: usize,
    pub fallback_stream: String,
    pub fuse: Option<String>,
    pub modulators: Vec<PluginConfig>,
    pub filter_after_format: Vec<PluginConfig>,
}

impl ProducerSettings {
    pub fn read(reader: &mut PluginConfigReader<'_>) -> Self {
        let fuse = reader.get_str("Fuse", "");
        Self {
            streams: reader.get_string_list("Streams", &["*"]),
            channel_capacity: reader.get_int("Channel", 8192).max(1) as usize,
            channel_timeout: TimeoutPolicy::from_ms(reader.get_int("ChannelTimeoutMs", 0)),
            shutdown_timeout: reader.get_duration_ms("ShutdownTimeoutMs", Duration::from_secs(1)),
            workers: reader.get_int("Workers", 1).max(1) as usize,
            fallback_stream: reader.get_str("FallbackStream", FALLBACK_STREAM),
            fuse: (!fuse.is_empty()).then_some(fuse),
            modulators: reader.get_plugin_list("Modulators"),
            filter_after_format: reader.get_plugin_list("FilterAfterFormat"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle — what routers see
// ---------------------------------------------------------------------------

/// Router-facing side of a producer: enqueue, state, control.
pub struct ProducerHandle {
    name: String,
    sender: mpsc::Sender<Message>,
    control: broadcast::Sender<ControlCommand>,
    state: Arc<StateCell>,
    streams: Vec<StreamId>,
    fallback_id: StreamId,
    channel_timeout: TimeoutPolicy,
    shutdown_timeout: Duration,
    fuse: Option<Arc<Fuse>>,
}

impl ProducerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &StateCell {
        &self.state
    }

    /// Streams this producer is bound to.
    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    pub fn fallback_id(&self) -> StreamId {
        self.fallback_id
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn send_control(&self, cmd: ControlCommand) {
        if self.control.send(cmd).is_err() {
            tracing::debug!(producer = %self.name, ?cmd, "control command had no receiver");
        }
    }

    /// Hand one message to the producer, waiting at most the effective
    /// timeout. A full channel past the timeout, a burned fuse, or a
    /// closed channel all route the message to the fallback stream.
    pub async fn enqueue(
        &self,
        msg: Message,
        timeout_override: Option<TimeoutPolicy>,
        registry: &Arc<StreamRegistry>,
    ) {
        if let Some(fuse) = &self.fuse {
            if fuse.is_burned() {
                registry.route_to_fallback(msg, self.fallback_id()).await;
                return;
            }
        }

        let policy = timeout_override.unwrap_or(self.channel_timeout);
        let rejected = match policy {
            TimeoutPolicy::Block => self.sender.send(msg).await.err().map(|e| e.0),
            TimeoutPolicy::Immediate => self.sender.try_send(msg).err().map(|e| match e {
                mpsc::error::TrySendError::Full(m) => m,
                mpsc::error::TrySendError::Closed(m) => m,
            }),
            TimeoutPolicy::After(timeout) => {
                self.sender
                    .send_timeout(msg, timeout)
                    .await
                    .err()
                    .map(|e| match e {
                        mpsc::error::SendTimeoutError::Timeout(m) => m,
                        mpsc::error::SendTimeoutError::Closed(m) => m,
                    })
            }
        };

        if let Some(msg) = rejected {
            registry.route_to_fallback(msg, self.fallback_id()).await;
        }
    }
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Everything the coordinator needs to build a producer runtime.
pub struct ProducerSpec {
    pub name: String,
    pub streams: Vec<StreamId>,
    pub fallback_id: StreamId,
    pub channel_capacity: usize,
    pub channel_timeout: TimeoutPolicy,
    pub shutdown_timeout: Duration,
    pub workers: usize,
    pub fuse: Option<Arc<Fuse>>,
    pub chain: ModulatorChain,
    pub after_chain: ModulatorChain,
}

pub struct ProducerRuntime {
    name: String,
    handle: Arc<ProducerHandle>,
    plugin: Arc<tokio::sync::Mutex<Box<dyn ProducerPlugin>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    chain: Arc<ModulatorChain>,
    after_chain: Arc<ModulatorChain>,
    workers: usize,
    tick: Option<Duration>,
    tracker: TaskTracker,
    registry: Arc<StreamRegistry>,
    m_filtered: Arc<dyn Metric>,
}

impl ProducerRuntime {
    pub fn new(
        spec: ProducerSpec,
        plugin: Box<dyn ProducerPlugin>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(spec.channel_capacity);
        let (control, _) = broadcast::channel(16);
        let tick = plugin.tick_interval();

        let handle = Arc::new(ProducerHandle {
            name: spec.name.clone(),
            sender,
            control,
            state: Arc::new(StateCell::new()),
            streams: spec.streams,
            fallback_id: spec.fallback_id,
            channel_timeout: spec.channel_timeout,
            shutdown_timeout: spec.shutdown_timeout,
            fuse: spec.fuse,
        });

        let m_filtered = registry.metrics().metric(metric_names::FILTERED);

        Self {
            name: spec.name,
            handle,
            plugin: Arc::new(tokio::sync::Mutex::new(plugin)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            chain: Arc::new(spec.chain),
            after_chain: Arc::new(spec.after_chain),
            workers: spec.workers,
            tick,
            tracker: TaskTracker::new(),
            registry,
            m_filtered,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> Arc<ProducerHandle> {
        self.handle.clone()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.handle.shutdown_timeout
    }

    /// Spawn the worker pool. Panicking workers are reported through
    /// `panic_tx` so the coordinator can initiate process-wide shutdown.
    pub fn start(&self, panic_tx: mpsc::UnboundedSender<String>) {
        for idx in 0..self.workers {
            let worker = Worker {
                idx,
                name: self.name.clone(),
                plugin: self.plugin.clone(),
                receiver: self.receiver.clone(),
                chain: self.chain.clone(),
                after_chain: self.after_chain.clone(),
                handle: self.handle.clone(),
                registry: self.registry.clone(),
                // One ticker per producer, owned by the first worker.
                tick: if idx == 0 { self.tick } else { None },
                m_filtered: self.m_filtered.clone(),
            };
            let control_rx = self.handle.control.subscribe();
            let join = self.tracker.spawn(worker.run(control_rx));
            tokio::spawn(supervise(join, self.name.clone(), panic_tx.clone()));
        }
        self.tracker.close();
        self.handle.state.set(PluginState::Active);
        tracing::info!(producer = %self.name, workers = self.workers, "producer started");
    }

    /// Wait for every worker to finish, up to `deadline`. Returns `false`
    /// when workers are still running past the deadline.
    pub async fn join(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for ProducerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRuntime")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .finish()
    }
}

async fn supervise(join: JoinHandle<()>, name: String, panic_tx: mpsc::UnboundedSender<String>) {
    if let Err(e) = join.await {
        if e.is_panic() {
            tracing::error!(producer = %name, error = %e, "worker panicked");
            let _ = panic_tx.send(name);
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    idx: usize,
    name: String,
    plugin: Arc<tokio::sync::Mutex<Box<dyn ProducerPlugin>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    chain: Arc<ModulatorChain>,
    after_chain: Arc<ModulatorChain>,
    handle: Arc<ProducerHandle>,
    registry: Arc<StreamRegistry>,
    tick: Option<Duration>,
    m_filtered: Arc<dyn Metric>,
}

impl Worker {
    /// Main loop. Control commands preempt message processing so shutdown
    /// latency stays bounded; the ticker is re-armed only after its
    /// callback returns, so ticks never overlap.
    async fn run(self, mut control_rx: broadcast::Receiver<ControlCommand>) {
        let mut next_tick = Instant::now() + self.tick.unwrap_or(Duration::from_secs(3600));

        loop {
            tokio::select! {
                biased;

                cmd = control_rx.recv() => match cmd {
                    Ok(ControlCommand::Stop) | Err(broadcast::error::RecvError::Closed) => {
                        self.drain().await;
                        return;
                    }
                    Ok(ControlCommand::Roll) => {
                        if self.idx == 0 {
                            if let Err(e) = self.plugin.lock().await.on_roll().await {
                                tracing::error!(producer = %self.name, error = %e, "roll failed");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(producer = %self.name, skipped = n, "control channel lagged");
                    }
                },

                msg = recv_shared(&self.receiver) => match msg {
                    Some(msg) => self.process(msg).await,
                    None => {
                        // Inbound closed underneath us: another worker is
                        // already draining.
                        return;
                    }
                },

                _ = tokio::time::sleep_until(next_tick), if self.tick.is_some() => {
                    if let Err(e) = self.plugin.lock().await.on_tick().await {
                        tracing::error!(producer = %self.name, error = %e, "tick failed");
                    }
                    next_tick = Instant::now() + self.tick.expect("guarded by condition");
                }
            }
        }
    }

    /// Run the chains and hand the message to the plugin, falling back on
    /// rejection or sink failure.
    async fn process(&self, mut msg: Message) {
        match self.chain.apply(&mut msg) {
            ModulateResult::Accept => {}
            ModulateResult::Drop => {
                self.m_filtered.inc();
                return;
            }
            ModulateResult::Reject => {
                self.registry
                    .route_to_fallback(msg, self.handle.fallback_id())
                    .await;
                return;
            }
        }

        match self.after_chain.apply(&mut msg) {
            ModulateResult::Accept => {}
            ModulateResult::Drop => {
                self.m_filtered.inc();
                return;
            }
            ModulateResult::Reject => {
                self.registry
                    .route_to_fallback(msg, self.handle.fallback_id())
                    .await;
                return;
            }
        }

        if let Some(fuse) = &self.handle.fuse {
            if fuse.is_burned() {
                self.registry
                    .route_to_fallback(msg, self.handle.fallback_id())
                    .await;
                return;
            }
        }

        let result = self.plugin.lock().await.on_message(&msg).await;
        match result {
            Ok(()) => {}
            Err(manifold_api::error::SinkError::Transient(reason)) => {
                tracing::warn!(producer = %self.name, %reason, "transient sink failure");
                if let Some(fuse) = &self.handle.fuse {
                    if fuse.burn() {
                        tracing::warn!(producer = %self.name, "fuse burned");
                    }
                }
                self.registry
                    .route_to_fallback(msg, self.handle.fallback_id())
                    .await;
            }
            Err(manifold_api::error::SinkError::Fatal(reason)) => {
                // Keep the producer alive so it can still drain at
                // shutdown; traffic moves to the fallback stream.
                tracing::error!(producer = %self.name, %reason, "fatal sink failure");
                self.registry
                    .route_to_fallback(msg, self.handle.fallback_id())
                    .await;
            }
        }
    }

    /// STOP path: run the stop callback, then drain the inbound channel
    /// through the normal dispatch path until it closes or the shutdown
    /// timeout elapses.
    async fn drain(&self) {
        self.handle.state.set(PluginState::Stopping);
        tracing::info!(producer = %self.name, "producer stopping");

        if self.idx == 0 {
            if let Err(e) = self.plugin.lock().await.on_stop().await {
                tracing::error!(producer = %self.name, error = %e, "stop callback failed");
            }
        }

        // Closing lets queued messages drain and makes recv return None;
        // late enqueues fail over to the fallback stream.
        self.receiver.lock().await.close();

        let deadline = Instant::now() + self.handle.shutdown_timeout;
        loop {
            let recv = async {
                let mut rx = self.receiver.lock().await;
                rx.recv().await
            };
            match tokio::time::timeout_at(deadline, recv).await {
                Ok(Some(msg)) => self.process(msg).await,
                Ok(None) => break,
                Err(_) => {
                    let abandoned = self.receiver.lock().await.len();
                    tracing::warn!(
                        producer = %self.name,
                        abandoned,
                        "shutdown timeout elapsed, abandoning in-flight messages"
                    );
                    break;
                }
            }
        }

        self.handle.state.set(PluginState::Dead);
        tracing::info!(producer = %self.name, "producer stopped");
    }
}

async fn recv_shared(receiver: &tokio::sync::Mutex<mpsc::Receiver<Message>>) -> Option<Message> {
    let mut guard = receiver.lock().await;
    guard.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_policy_regimes() {
        assert_eq!(TimeoutPolicy::from_ms(0), TimeoutPolicy::Block);
        assert_eq!(TimeoutPolicy::from_ms(-1), TimeoutPolicy::Immediate);
        assert_eq!(
            TimeoutPolicy::from_ms(50),
            TimeoutPolicy::After(Duration::from_millis(50))
        );
    }

    #[test]
    fn settings_defaults() {
        let config = PluginConfig::new("producer.Test");
        let mut reader = PluginConfigReader::new(&config);
        let settings = ProducerSettings::read(&mut reader);

        assert_eq!(settings.streams, vec!["*"]);
        assert_eq!(settings.channel_capacity, 8192);
        assert_eq!(settings.channel_timeout, TimeoutPolicy::Block);
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.fallback_stream, FALLBACK_STREAM);
        assert!(settings.fuse.is_none());
        assert!(reader.into_errors().is_empty());
    }

    #[test]
    fn settings_read_overrides() {
        let config = PluginConfig::new("producer.Test")
            .with("Channel", 1i64)
            .with("ChannelTimeoutMs", 50i64)
            .with("FallbackStream", "spill")
            .with("Fuse", "db")
            .with("Workers", 3i64);
        let mut reader = PluginConfigReader::new(&config);
        let settings = ProducerSettings::read(&mut reader);

        assert_eq!(settings.channel_capacity, 1);
        assert_eq!(
            settings.channel_timeout,
            TimeoutPolicy::After(Duration::from_millis(50))
        );
        assert_eq!(settings.fallback_stream, "spill");
        assert_eq!(settings.fuse.as_deref(), Some("db"));
        assert_eq!(settings.workers, 3);
    }
}
