//! Cross-component pipeline scenarios: fan-out, distribution policies,
//! timeout fallback, control commands, and ordered shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use manifold_api::config::{ConfigValue, PluginConfigReader};
use manifold_api::error::{PluginError, SinkError};
use manifold_api::fuse::Fuse;
use manifold_api::message::Message;
use manifold_api::metadata::Metadata;
use manifold_api::metrics::AtomicMetrics;
use manifold_api::modulator::ModulatorChain;
use manifold_api::plugin::{ConsumerContext, ConsumerPlugin, ControlCommand, ProducerPlugin};
use manifold_api::stream::StreamId;
use tokio_util::sync::CancellationToken;

use manifold_engine::config::{EngineConfig, NamedPlugin};
use manifold_engine::coordinator::Coordinator;
use manifold_engine::metric_names;
use manifold_engine::producer::{ProducerRuntime, ProducerSpec, TimeoutPolicy};
use manifold_engine::router::{Distribution, Router};
use manifold_engine::streams::StreamRegistry;

// ---------------------------------------------------------------------------
// Test sinks
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Collector {
    seen: Arc<parking_lot::Mutex<Vec<Message>>>,
}

impl Collector {
    fn len(&self) -> usize {
        self.seen.lock().len()
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().iter().map(|m| m.payload.clone()).collect()
    }
}

#[async_trait]
impl ProducerPlugin for Collector {
    fn configure(&mut self, _reader: &mut PluginConfigReader<'_>) {}

    async fn on_message(&mut self, msg: &Message) -> Result<(), SinkError> {
        self.seen.lock().push(msg.clone());
        Ok(())
    }
}

/// Sink whose dispatch never completes — the channel backs up behind it.
struct StuckSink;

#[async_trait]
impl ProducerPlugin for StuckSink {
    fn configure(&mut self, _reader: &mut PluginConfigReader<'_>) {}

    async fn on_message(&mut self, _msg: &Message) -> Result<(), SinkError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Sink taking roughly a millisecond per message.
#[derive(Clone, Default)]
struct SlowSink {
    delivered: Arc<AtomicUsize>,
}

#[async_trait]
impl ProducerPlugin for SlowSink {
    fn configure(&mut self, _reader: &mut PluginConfigReader<'_>) {}

    async fn on_message(&mut self, _msg: &Message) -> Result<(), SinkError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Sink that fails with a transient error while `healthy` is false.
#[derive(Clone, Default)]
struct FlakySink {
    healthy: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    delivered: Arc<AtomicUsize>,
}

#[async_trait]
impl ProducerPlugin for FlakySink {
    fn configure(&mut self, _reader: &mut PluginConfigReader<'_>) {}

    async fn on_message(&mut self, _msg: &Message) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.healthy.load(Ordering::Relaxed) {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(SinkError::transient("sink offline"))
        }
    }
}

/// Producer plugin counting roll callbacks.
#[derive(Clone, Default)]
struct RollAwareSink {
    rolls: Arc<AtomicUsize>,
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl ProducerPlugin for RollAwareSink {
    fn configure(&mut self, _reader: &mut PluginConfigReader<'_>) {}

    async fn on_message(&mut self, _msg: &Message) -> Result<(), SinkError> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn on_roll(&mut self) -> Result<(), PluginError> {
        self.rolls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spec(name: &str, stream: StreamId, fallback: StreamId) -> ProducerSpec {
    ProducerSpec {
        name: name.to_string(),
        streams: vec![stream],
        fallback_id: fallback,
        channel_capacity: 512,
        channel_timeout: TimeoutPolicy::Block,
        shutdown_timeout: Duration::from_secs(2),
        workers: 1,
        fuse: None,
        chain: ModulatorChain::new(),
        after_chain: ModulatorChain::new(),
    }
}

fn panic_channel() -> tokio::sync::mpsc::UnboundedSender<String> {
    tokio::sync::mpsc::unbounded_channel().0
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Fan-out and distribution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_delivers_to_every_producer() {
    let registry = StreamRegistry::new(Arc::new(AtomicMetrics::new()), 8);
    let stream_a = registry.intern_name("A");

    let p1 = Collector::default();
    let p2 = Collector::default();
    let r1 = ProducerRuntime::new(
        spec("P1", stream_a, StreamId::FALLBACK),
        Box::new(p1.clone()),
        registry.clone(),
    );
    let r2 = ProducerRuntime::new(
        spec("P2", stream_a, StreamId::FALLBACK),
        Box::new(p2.clone()),
        registry.clone(),
    );

    let router = registry
        .register(Router::auto(
            "A".to_string(),
            stream_a,
            Distribution::Broadcast,
            registry.metrics().as_ref(),
        ))
        .unwrap();
    router.add_producer(r1.handle());
    router.add_producer(r2.handle());

    r1.start(panic_channel());
    r2.start(panic_channel());

    registry
        .dispatch(Message::new(b"hello".to_vec(), stream_a))
        .await;

    wait_until("both producers to observe the message", || {
        p1.len() == 1 && p2.len() == 1
    })
    .await;

    for collector in [&p1, &p2] {
        let seen = collector.seen.lock();
        assert_eq!(seen[0].payload, b"hello");
        assert_eq!(seen[0].stream_id(), stream_a);
    }
}

#[tokio::test]
async fn round_robin_splits_by_insertion_order() {
    let registry = StreamRegistry::new(Arc::new(AtomicMetrics::new()), 8);
    let stream_b = registry.intern_name("B");

    let collectors: Vec<Collector> = (0..3).map(|_| Collector::default()).collect();
    let runtimes: Vec<ProducerRuntime> = collectors
        .iter()
        .enumerate()
        .map(|(i, c)| {
            ProducerRuntime::new(
                spec(&format!("R{}", i + 1), stream_b, StreamId::FALLBACK),
                Box::new(c.clone()),
                registry.clone(),
            )
        })
        .collect();

    let router = registry
        .register(Router::auto(
            "B".to_string(),
            stream_b,
            Distribution::RoundRobin,
            registry.metrics().as_ref(),
        ))
        .unwrap();
    for runtime in &runtimes {
        router.add_producer(runtime.handle());
        runtime.start(panic_channel());
    }

    for i in 0..10 {
        registry
            .dispatch(Message::new(format!("m{i}").into_bytes(), stream_b))
            .await;
    }

    wait_until("all ten messages to land", || {
        collectors.iter().map(Collector::len).sum::<usize>() == 10
    })
    .await;

    let counts: Vec<usize> = collectors.iter().map(Collector::len).collect();
    assert_eq!(counts, vec![4, 3, 3]);
}

#[tokio::test]
async fn random_distribution_picks_exactly_one() {
    let registry = StreamRegistry::new(Arc::new(AtomicMetrics::new()), 8);
    let stream = registry.intern_name("rand");

    let collectors: Vec<Collector> = (0..3).map(|_| Collector::default()).collect();
    let runtimes: Vec<ProducerRuntime> = collectors
        .iter()
        .map(|c| {
            ProducerRuntime::new(
                spec("R", stream, StreamId::FALLBACK),
                Box::new(c.clone()),
                registry.clone(),
            )
        })
        .collect();

    let router = registry
        .register(Router::auto(
            "rand".to_string(),
            stream,
            Distribution::Random,
            registry.metrics().as_ref(),
        ))
        .unwrap();
    for runtime in &runtimes {
        router.add_producer(runtime.handle());
        runtime.start(panic_channel());
    }

    for _ in 0..50 {
        registry.dispatch(Message::new(b"x".to_vec(), stream)).await;
    }

    wait_until("all fifty messages to land", || {
        collectors.iter().map(Collector::len).sum::<usize>() == 50
    })
    .await;
}

// ---------------------------------------------------------------------------
// Timeout fallback (saturated producer)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saturated_producer_times_out_to_fallback() {
    let metrics = Arc::new(AtomicMetrics::new());
    let registry = StreamRegistry::new(metrics.clone(), 8);
    let stream_s = registry.intern_name("S");
    let stream_f = registry.intern_name("F");

    // Pslow: capacity 1, 50ms timeout, never started — nothing consumes.
    let mut slow_spec = spec("Pslow", stream_s, stream_f);
    slow_spec.channel_capacity = 1;
    slow_spec.channel_timeout = TimeoutPolicy::After(Duration::from_millis(50));
    let slow = ProducerRuntime::new(slow_spec, Box::new(StuckSink), registry.clone());

    let router_s = registry
        .register(Router::auto(
            "S".to_string(),
            stream_s,
            Distribution::Broadcast,
            registry.metrics().as_ref(),
        ))
        .unwrap();
    router_s.add_producer(slow.handle());

    // Fallback stream F with a live collector.
    let rescued = Collector::default();
    let rescue = ProducerRuntime::new(
        spec("PF", stream_f, StreamId::INVALID),
        Box::new(rescued.clone()),
        registry.clone(),
    );
    let router_f = registry
        .register(Router::auto(
            "F".to_string(),
            stream_f,
            Distribution::Broadcast,
            registry.metrics().as_ref(),
        ))
        .unwrap();
    router_f.add_producer(rescue.handle());
    rescue.start(panic_channel());

    for i in 0..10 {
        registry
            .dispatch(Message::new(format!("m{i}").into_bytes(), stream_s))
            .await;
    }

    wait_until("nine messages to reach the fallback stream", || {
        rescued.len() == 9
    })
    .await;

    // Nothing silently dropped, origin survives the reroute.
    assert_eq!(metrics.value(metric_names::DROPPED), 0);
    assert_eq!(metrics.value(metric_names::FALLBACK_ROUTED), 9);
    let seen = rescued.seen.lock();
    for msg in seen.iter() {
        assert_eq!(msg.origin_stream_id(), stream_s);
        assert_eq!(msg.stream_id(), stream_f);
        assert_eq!(msg.prev_stream_id(), stream_s);
    }
}

// ---------------------------------------------------------------------------
// Fuse
// ---------------------------------------------------------------------------

#[tokio::test]
async fn burned_fuse_reroutes_until_activated() {
    let registry = StreamRegistry::new(Arc::new(AtomicMetrics::new()), 8);
    let stream = registry.intern_name("db");
    let spill = registry.intern_name("spill");

    let fuse = Arc::new(Fuse::new());
    let flaky = FlakySink::default();
    let mut flaky_spec = spec("db-sink", stream, spill);
    flaky_spec.fuse = Some(fuse.clone());
    let flaky_rt = ProducerRuntime::new(flaky_spec, Box::new(flaky.clone()), registry.clone());

    let router = registry
        .register(Router::auto(
            "db".to_string(),
            stream,
            Distribution::Broadcast,
            registry.metrics().as_ref(),
        ))
        .unwrap();
    router.add_producer(flaky_rt.handle());
    flaky_rt.start(panic_channel());

    let rescued = Collector::default();
    let rescue = ProducerRuntime::new(
        spec("spill-sink", spill, StreamId::INVALID),
        Box::new(rescued.clone()),
        registry.clone(),
    );
    let router_spill = registry
        .register(Router::auto(
            "spill".to_string(),
            spill,
            Distribution::Broadcast,
            registry.metrics().as_ref(),
        ))
        .unwrap();
    router_spill.add_producer(rescue.handle());
    rescue.start(panic_channel());

    // First message hits the sink, fails, burns the fuse, lands in spill.
    registry.dispatch(Message::new(b"m1".to_vec(), stream)).await;
    wait_until("fuse to burn", || fuse.is_burned()).await;
    wait_until("first message to spill", || rescued.len() == 1).await;
    assert_eq!(flaky.attempts.load(Ordering::Relaxed), 1);

    // While burned, messages bypass the sink entirely.
    registry.dispatch(Message::new(b"m2".to_vec(), stream)).await;
    wait_until("second message to spill", || rescued.len() == 2).await;
    assert_eq!(flaky.attempts.load(Ordering::Relaxed), 1);

    // Health restored: activate and deliver normally again.
    flaky.healthy.store(true, Ordering::Relaxed);
    fuse.activate();
    registry.dispatch(Message::new(b"m3".to_vec(), stream)).await;
    wait_until("third message to deliver", || {
        flaky.delivered.load(Ordering::Relaxed) == 1
    })
    .await;
    assert_eq!(rescued.len(), 2);
}

// ---------------------------------------------------------------------------
// Shutdown with backlog
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_the_backlog() {
    let registry = StreamRegistry::new(Arc::new(AtomicMetrics::new()), 8);
    let stream = registry.intern_name("bulk");

    let sink = SlowSink::default();
    let mut slow_spec = spec("PN", stream, StreamId::INVALID);
    slow_spec.channel_capacity = 1024;
    slow_spec.shutdown_timeout = Duration::from_secs(2);
    let runtime = ProducerRuntime::new(slow_spec, Box::new(sink.clone()), registry.clone());
    runtime.start(panic_channel());

    let handle = runtime.handle();
    for i in 0..300 {
        handle
            .enqueue(
                Message::new(format!("m{i}").into_bytes(), stream),
                None,
                &registry,
            )
            .await;
    }

    handle.send_control(ControlCommand::Stop);

    // The coordinator would wait shutdown_timeout × 10.
    let deadline = Instant::now() + Duration::from_secs(20);
    assert!(runtime.join(deadline).await, "workers exceeded the wait timeout");
    assert_eq!(sink.delivered.load(Ordering::Relaxed), 300);
}

// ---------------------------------------------------------------------------
// Full coordinator lifecycle (configure → start → roll → shutdown)
// ---------------------------------------------------------------------------

static COORD_SINK_SEEN: AtomicUsize = AtomicUsize::new(0);
static COORD_SINK_ROLLS: AtomicUsize = AtomicUsize::new(0);
static COORD_SOURCE_ROLLS: AtomicUsize = AtomicUsize::new(0);

struct CoordSink;

#[async_trait]
impl ProducerPlugin for CoordSink {
    fn configure(&mut self, _reader: &mut PluginConfigReader<'_>) {}

    async fn on_message(&mut self, _msg: &Message) -> Result<(), SinkError> {
        COORD_SINK_SEEN.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn on_roll(&mut self) -> Result<(), PluginError> {
        COORD_SINK_ROLLS.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct CoordSource;

#[async_trait]
impl ConsumerPlugin for CoordSource {
    fn configure(&mut self, _reader: &mut PluginConfigReader<'_>) {}

    async fn run(
        &self,
        ctx: ConsumerContext,
        cancel: CancellationToken,
    ) -> Result<(), PluginError> {
        for i in 0..5 {
            ctx.emit(format!("e{i}").into_bytes(), Metadata::new()).await;
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn on_roll(&self) -> Result<(), PluginError> {
        COORD_SOURCE_ROLLS.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn plugin_entry(name: &str, typename: &str, settings: &[(&str, ConfigValue)]) -> NamedPlugin {
    let mut config = manifold_api::config::PluginConfig::new(typename);
    for (key, value) in settings {
        config.settings.insert(key.to_string(), value.clone());
    }
    NamedPlugin {
        name: name.to_string(),
        enabled: true,
        config,
    }
}

#[tokio::test]
async fn coordinator_runs_a_wildcard_pipeline_end_to_end() {
    manifold_engine::registry::register_producer("test.producer.CoordSink", || {
        Box::new(CoordSink)
    });
    manifold_engine::registry::register_consumer("test.consumer.CoordSource", || {
        Box::new(CoordSource)
    });

    let config = EngineConfig {
        settings: Default::default(),
        plugins: vec![
            plugin_entry(
                "sink",
                "test.producer.CoordSink",
                &[("Streams", ConfigValue::from("*"))],
            ),
            plugin_entry(
                "source",
                "test.consumer.CoordSource",
                &[("Streams", ConfigValue::from("events"))],
            ),
        ],
    };

    let mut coordinator =
        Coordinator::configure(config, Arc::new(AtomicMetrics::new())).unwrap();
    assert_eq!(coordinator.producer_count(), 1);
    assert_eq!(coordinator.consumer_count(), 1);

    coordinator.start();

    wait_until("the wildcard sink to observe the events", || {
        COORD_SINK_SEEN.load(Ordering::Relaxed) >= 5
    })
    .await;

    // One ROLL signal → exactly one roll callback per plugin.
    let handle = coordinator.handle();
    handle.roll();
    handle.exit();
    coordinator.run().await.unwrap();
    coordinator.shutdown().await;

    assert_eq!(COORD_SINK_ROLLS.load(Ordering::Relaxed), 1);
    assert_eq!(COORD_SOURCE_ROLLS.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn configure_rejects_an_empty_graph() {
    let config = EngineConfig::default();
    assert!(Coordinator::configure(config, Arc::new(AtomicMetrics::new())).is_err());
}
