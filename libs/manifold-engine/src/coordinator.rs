//! Coordinator — top-level owner of the pipeline graph.
//!
//! Configures the graph (routers first, then producers, then consumers),
//! starts components in dependency order, routes OS signals, and runs the
//! ordered shutdown: consumers first to stop the ingress, log flush, then
//! producers with the computed wait timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::Instant;

use manifold_api::config::{ErrorStack, PluginConfigReader};
use manifold_api::fuse::Fuse;
use manifold_api::metrics::MetricsProvider;
use manifold_api::plugin::ControlCommand;
use manifold_api::stream::{
    FALLBACK_STREAM, INTERNAL_LOG_STREAM, StreamId, WILDCARD_STREAM,
};

use crate::config::EngineConfig;
use crate::consumer::{ConsumerRuntime, ConsumerSettings, ConsumerSpec};
use crate::error::EngineError;
use crate::metric_names;
use crate::producer::{ProducerRuntime, ProducerSettings, ProducerSpec, TimeoutPolicy};
use crate::registry::{self, PluginCtor};
use crate::router::Router;
use crate::streams::StreamRegistry;

/// Explicit, sequential lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Configure,
    StartProducers,
    StartConsumers,
    Running,
    Shutdown,
    StopConsumers,
    StopProducers,
    Stopped,
}

/// Signal fed into the run loop, either from the OS or programmatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Exit,
    Roll,
}

/// Cloneable handle for driving a running coordinator (tests, embedders).
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<RunSignal>,
}

impl CoordinatorHandle {
    pub fn exit(&self) {
        let _ = self.tx.send(RunSignal::Exit);
    }

    pub fn roll(&self) {
        let _ = self.tx.send(RunSignal::Roll);
    }
}

pub struct Coordinator {
    state: CoordinatorState,
    registry: Arc<StreamRegistry>,
    producers: Vec<ProducerRuntime>,
    consumers: Vec<ConsumerRuntime>,
    fuses: HashMap<String, Arc<Fuse>>,

    signal_tx: mpsc::UnboundedSender<RunSignal>,
    signal_rx: mpsc::UnboundedReceiver<RunSignal>,
    panic_tx: mpsc::UnboundedSender<String>,
    panic_rx: mpsc::UnboundedReceiver<String>,
}

impl Coordinator {
    /// Build the full graph from a parsed configuration.
    ///
    /// Routers are constructed first (no dependencies), then producers
    /// (referencing routers through the stream registry), then consumers.
    /// A plugin that accumulates a fatal config error is rejected and
    /// omitted; non-fatal problems are logged and the plugin still runs.
    pub fn configure(
        config: EngineConfig,
        metrics: Arc<dyn MetricsProvider>,
    ) -> Result<Self, EngineError> {
        let registry = StreamRegistry::new(metrics, config.settings.max_fallback_depth);

        let mut router_configs = Vec::new();
        let mut producer_configs = Vec::new();
        let mut consumer_configs = Vec::new();

        for named in config.plugins {
            if !named.enabled {
                tracing::info!(instance = %named.name, "plugin disabled, skipping");
                continue;
            }
            match registry::resolve(&named.config.typename) {
                Ok(PluginCtor::Router(distribution)) => router_configs.push((named, distribution)),
                Ok(PluginCtor::Producer(ctor)) => producer_configs.push((named, ctor)),
                Ok(PluginCtor::Consumer(ctor)) => consumer_configs.push((named, ctor)),
                Ok(PluginCtor::Modulator(_)) => {
                    tracing::error!(
                        instance = %named.name,
                        typename = %named.config.typename,
                        "modulators cannot be top-level instances, rejecting plugin"
                    );
                }
                Err(e) => {
                    tracing::error!(instance = %named.name, error = %e, "rejecting plugin");
                }
            }
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (panic_tx, panic_rx) = mpsc::unbounded_channel();
        let mut coordinator = Self {
            state: CoordinatorState::Configure,
            registry,
            producers: Vec::new(),
            consumers: Vec::new(),
            fuses: HashMap::new(),
            signal_tx,
            signal_rx,
            panic_tx,
            panic_rx,
        };

        for (named, distribution) in router_configs {
            coordinator.configure_router(named, distribution);
        }
        for (named, ctor) in producer_configs {
            coordinator.configure_producer(named, ctor);
        }
        for (named, ctor) in consumer_configs {
            coordinator.configure_consumer(named, ctor);
        }

        coordinator.registry.finalize_wildcard();

        if coordinator.producers.is_empty() {
            return Err(EngineError::Config(
                "configuration defines no usable producer".to_string(),
            ));
        }
        if coordinator.consumers.is_empty() {
            return Err(EngineError::Config(
                "configuration defines no usable consumer".to_string(),
            ));
        }

        tracing::info!(
            routers = coordinator.registry.router_count(),
            producers = coordinator.producers.len(),
            consumers = coordinator.consumers.len(),
            "pipeline configured"
        );
        Ok(coordinator)
    }

    fn configure_router(&mut self, named: crate::config::NamedPlugin, distribution: crate::router::Distribution) {
        let mut reader = PluginConfigReader::new(&named.config);
        let stream = reader.require_str("Stream");
        let fallback = reader.get_str("FallbackStream", FALLBACK_STREAM);
        let timeout_override = reader
            .has("ChannelTimeoutMs")
            .then(|| TimeoutPolicy::from_ms(reader.get_int("ChannelTimeoutMs", 0)));
        let modulators = reader.get_plugin_list("Modulators");
        let mut errors = reader.into_errors();
        let chain = registry::build_chain(&modulators, &mut errors);

        if report_issues(&named.name, &errors) {
            return;
        }

        let stream_id = self.registry.intern_name(&stream);
        let fallback_id = self.registry.intern_name(&fallback);
        let router = Router::new(
            stream.clone(),
            stream_id,
            distribution,
            chain,
            fallback_id,
            timeout_override,
            self.registry.metrics().as_ref(),
        );
        match self.registry.register(router) {
            Ok(_) => {
                tracing::info!(instance = %named.name, stream = %stream, ?distribution, "router configured");
            }
            Err(e) => {
                tracing::error!(instance = %named.name, error = %e, "rejecting router");
            }
        }
    }

    fn configure_producer(&mut self, named: crate::config::NamedPlugin, ctor: registry::ProducerCtor) {
        let mut reader = PluginConfigReader::new(&named.config);
        let settings = ProducerSettings::read(&mut reader);
        let mut plugin = ctor();
        plugin.configure(&mut reader);
        plugin.attach_metrics(self.registry.metrics().clone());
        let mut errors = reader.into_errors();

        let chain = registry::build_chain(&settings.modulators, &mut errors);
        let after_chain = registry::build_chain(&settings.filter_after_format, &mut errors);

        if report_issues(&named.name, &errors) {
            return;
        }

        let fuse = settings.fuse.as_ref().map(|name| {
            self.fuses
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Fuse::new()))
                .clone()
        });

        let mut stream_ids = Vec::new();
        let mut wildcard = false;
        for name in &settings.streams {
            if name == WILDCARD_STREAM {
                wildcard = true;
                stream_ids.push(StreamId::WILDCARD);
            } else {
                stream_ids.push(self.registry.intern_name(name));
            }
        }

        let spec = ProducerSpec {
            name: named.name.clone(),
            streams: stream_ids,
            fallback_id: self.registry.intern_name(&settings.fallback_stream),
            channel_capacity: settings.channel_capacity,
            channel_timeout: settings.channel_timeout,
            shutdown_timeout: settings.shutdown_timeout,
            workers: settings.workers,
            fuse,
            chain,
            after_chain,
        };
        let runtime = ProducerRuntime::new(spec, plugin, self.registry.clone());
        let handle = runtime.handle();

        if wildcard {
            self.registry.register_wildcard_producer(handle.clone());
        }
        for id in handle.streams() {
            if *id == StreamId::WILDCARD {
                continue;
            }
            self.registry.get_or_create(*id).add_producer(handle.clone());
        }

        tracing::info!(
            instance = %named.name,
            streams = ?settings.streams,
            "producer configured"
        );
        self.producers.push(runtime);
    }

    fn configure_consumer(&mut self, named: crate::config::NamedPlugin, ctor: registry::ConsumerCtor) {
        let mut reader = PluginConfigReader::new(&named.config);
        let settings = ConsumerSettings::read(&mut reader);
        let mut plugin = ctor();
        plugin.configure(&mut reader);
        let mut errors = reader.into_errors();

        let chain = registry::build_chain(&settings.modulators, &mut errors);
        if settings.streams.is_empty() {
            errors.push_fatal("option 'Streams' is required for consumers");
        }

        if report_issues(&named.name, &errors) {
            return;
        }

        let stream_ids = settings
            .streams
            .iter()
            .map(|name| self.registry.intern_name(name))
            .collect();

        let spec = ConsumerSpec {
            name: named.name.clone(),
            streams: stream_ids,
            workers: settings.workers,
            shutdown_timeout: settings.shutdown_timeout,
            chain,
        };
        tracing::info!(
            instance = %named.name,
            streams = ?settings.streams,
            "consumer configured"
        );
        self.consumers.push(ConsumerRuntime::new(spec, plugin));
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Shared fuse by name, for health probes that re-activate burned
    /// fuses.
    pub fn fuse(&self, name: &str) -> Option<Arc<Fuse>> {
        self.fuses.get(name).cloned()
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.signal_tx.clone(),
        }
    }

    // -----------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------

    /// Start producers, attach the internal log consumer when the log
    /// stream has producers, then start consumers.
    pub fn start(&mut self) {
        self.state = CoordinatorState::StartProducers;
        for producer in &self.producers {
            producer.start(self.panic_tx.clone());
        }

        // Log lines only flow through the pipeline when something is
        // listening on the internal log stream.
        if let Some(router) = self.registry.get(StreamId::INTERNAL_LOG) {
            if router.producer_count() > 0 {
                let spec = ConsumerSpec {
                    name: "log-bus".to_string(),
                    streams: vec![StreamId::INTERNAL_LOG],
                    workers: 1,
                    shutdown_timeout: Duration::from_secs(1),
                    chain: Default::default(),
                };
                self.registry.intern_name(INTERNAL_LOG_STREAM);
                let runtime = ConsumerRuntime::new(spec, crate::logbus::new_log_consumer());
                tracing::info!("internal log consumer attached");
                // Last in the list, so it stops after every other consumer
                // and their shutdown logs still reach the pipeline.
                self.consumers.push(runtime);
            }
        }

        self.state = CoordinatorState::StartConsumers;
        for consumer in &self.consumers {
            consumer.start(&self.registry, self.panic_tx.clone());
        }

        let metrics = self.registry.metrics();
        metrics
            .metric(metric_names::ACTIVE_PRODUCERS)
            .set(self.producers.len() as i64);
        metrics
            .metric(metric_names::ACTIVE_CONSUMERS)
            .set(self.consumers.len() as i64);

        self.state = CoordinatorState::Running;
        tracing::info!("pipeline running");
    }

    // -----------------------------------------------------------------
    // Run — block on signals
    // -----------------------------------------------------------------

    /// Block until an exit condition: INT/TERM/USR1, a programmatic
    /// [`CoordinatorHandle::exit`], or a worker panic. HUP broadcasts a
    /// ROLL command to every consumer and producer.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        loop {
            // Translate whatever woke us into an action first; the select
            // borrows the signal channels, acting on the graph happens
            // after it returns.
            let action = tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                    RunSignal::Exit
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    RunSignal::Exit
                }
                _ = sigusr1.recv() => {
                    tracing::info!("SIGUSR1 received, shutting down");
                    RunSignal::Exit
                }
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP received, rolling");
                    RunSignal::Roll
                }
                sig = self.signal_rx.recv() => sig.unwrap_or(RunSignal::Exit),
                name = self.panic_rx.recv() => {
                    if let Some(name) = name {
                        tracing::error!(plugin = %name, "worker panic, initiating shutdown");
                    }
                    RunSignal::Exit
                }
            };

            match action {
                RunSignal::Exit => return Ok(()),
                RunSignal::Roll => roll_all(&self.consumers, &self.producers).await,
            }
        }
    }

    // -----------------------------------------------------------------
    // Shutdown — consumers first, then producers with the computed wait
    // -----------------------------------------------------------------

    /// Ordered teardown. Producers exceeding the computed wait timeout
    /// (max shutdown timeout × 10) are reported, not force-killed.
    pub async fn shutdown(mut self) {
        self.state = CoordinatorState::Shutdown;
        tracing::info!("pipeline shutting down");
        let metrics = self.registry.metrics().clone();
        let m_consumers = metrics.metric(metric_names::ACTIVE_CONSUMERS);
        let m_producers = metrics.metric(metric_names::ACTIVE_PRODUCERS);

        self.state = CoordinatorState::StopConsumers;
        for consumer in &self.consumers {
            consumer.stop().await;
            m_consumers.dec();
        }

        self.state = CoordinatorState::StopProducers;
        let wait = self
            .producers
            .iter()
            .map(|p| p.shutdown_timeout())
            .max()
            .unwrap_or(Duration::from_secs(1))
            * 10;
        let deadline = Instant::now() + wait;

        for producer in &self.producers {
            producer.handle().send_control(ControlCommand::Stop);
        }
        for producer in &self.producers {
            if producer.join(deadline).await {
                m_producers.dec();
            } else {
                tracing::warn!(
                    producer = %producer.name(),
                    state = ?producer.handle().state().get(),
                    "producer did not stop within the wait timeout"
                );
            }
        }

        self.state = CoordinatorState::Stopped;
        tracing::info!("pipeline stopped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state)
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

async fn roll_all(consumers: &[ConsumerRuntime], producers: &[ProducerRuntime]) {
    for consumer in consumers {
        consumer.roll().await;
    }
    for producer in producers {
        producer.handle().send_control(ControlCommand::Roll);
    }
}

/// Log accumulated config issues. Returns `true` when the plugin must be
/// rejected.
fn report_issues(instance: &str, errors: &ErrorStack) -> bool {
    for issue in errors.iter() {
        if issue.fatal {
            tracing::error!(instance = %instance, "{}", issue.message);
        } else {
            tracing::warn!(instance = %instance, "{}", issue.message);
        }
    }
    if errors.has_fatal() {
        tracing::error!(instance = %instance, "plugin rejected due to fatal config errors");
        true
    } else {
        false
    }
}
