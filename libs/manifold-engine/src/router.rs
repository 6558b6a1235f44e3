//! Router — the component bound to one stream that decides which
//! producers receive a message.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use manifold_api::message::Message;
use manifold_api::metrics::{Metric, MetricsProvider};
use manifold_api::modulator::{ModulateResult, ModulatorChain};
use manifold_api::stream::StreamId;

use crate::metric_names;
use crate::producer::{ProducerHandle, TimeoutPolicy};
use crate::streams::StreamRegistry;

/// How a router spreads messages over its bound producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Every producer receives an owned clone; the last one receives the
    /// original.
    Broadcast,
    /// One uniformly random producer.
    Random,
    /// Per-router counter modulo producer count. Rebinding resets the
    /// counter.
    RoundRobin,
}

pub struct Router {
    name: String,
    stream_id: StreamId,
    distribution: Distribution,
    rr_counter: AtomicUsize,
    chain: ModulatorChain,
    producers: RwLock<Vec<Arc<ProducerHandle>>>,
    fallback_id: StreamId,
    /// Per-stream enqueue timeout; `None` defers to each producer's own.
    timeout_override: Option<TimeoutPolicy>,
    auto_created: bool,

    m_routed: Arc<dyn Metric>,
    m_filtered: Arc<dyn Metric>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        stream_id: StreamId,
        distribution: Distribution,
        chain: ModulatorChain,
        fallback_id: StreamId,
        timeout_override: Option<TimeoutPolicy>,
        metrics: &dyn MetricsProvider,
    ) -> Self {
        let m_routed = metrics.metric(&metric_names::stream_routed(&name));
        let m_filtered = metrics.metric(metric_names::FILTERED);
        Self {
            name,
            stream_id,
            distribution,
            rr_counter: AtomicUsize::new(0),
            chain,
            producers: RwLock::new(Vec::new()),
            fallback_id,
            timeout_override,
            auto_created: false,
            m_routed,
            m_filtered,
        }
    }

    /// Default broadcast router created lazily for an unregistered stream.
    pub fn auto(
        name: String,
        stream_id: StreamId,
        distribution: Distribution,
        metrics: &dyn MetricsProvider,
    ) -> Self {
        let mut router = Router::new(
            name,
            stream_id,
            distribution,
            ModulatorChain::new(),
            StreamId::FALLBACK,
            None,
            metrics,
        );
        router.auto_created = true;
        router
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_auto_created(&self) -> bool {
        self.auto_created
    }

    pub fn producer_count(&self) -> usize {
        read_producers(&self.producers).len()
    }

    /// Bind a producer. Duplicates (by handle identity) are ignored;
    /// rebinding resets the round-robin counter.
    pub fn add_producer(&self, producer: Arc<ProducerHandle>) {
        let mut guard = match self.producers.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(stream = %self.name, "producer list lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if guard.iter().any(|p| Arc::ptr_eq(p, &producer)) {
            return;
        }
        guard.push(producer);
        self.rr_counter.store(0, Ordering::Release);
    }

    /// Route one message addressed to this stream.
    ///
    /// Runs the stream-local chain, then applies the distribution policy
    /// over producers that still accept messages. With no eligible
    /// producer the message goes to fallback routing — unless it already
    /// arrived here through fallback routing, in which case it is silently
    /// dropped and counted.
    pub async fn enqueue(&self, registry: &Arc<StreamRegistry>, mut msg: Message) {
        debug_assert_eq!(msg.stream_id(), self.stream_id);

        match self.chain.apply(&mut msg) {
            ModulateResult::Accept => {}
            ModulateResult::Drop => {
                self.m_filtered.inc();
                return;
            }
            ModulateResult::Reject => {
                registry.route_to_fallback(msg, self.fallback_id).await;
                return;
            }
        }

        // A formatter may have rerouted the message.
        if msg.stream_id() != self.stream_id {
            registry.dispatch_boxed(msg).await;
            return;
        }

        let eligible: Vec<Arc<ProducerHandle>> = read_producers(&self.producers)
            .iter()
            .filter(|p| p.state().accepts_messages())
            .cloned()
            .collect();

        if eligible.is_empty() {
            if msg.fallback_hops() > 0 {
                registry.note_dropped();
            } else {
                registry.route_to_fallback(msg, self.fallback_id).await;
            }
            return;
        }

        self.m_routed.inc();
        match self.distribution {
            Distribution::Broadcast => {
                let (last, rest) = eligible.split_last().expect("eligible is non-empty");
                for producer in rest {
                    producer
                        .enqueue(msg.clone(), self.timeout_override, registry)
                        .await;
                }
                last.enqueue(msg, self.timeout_override, registry).await;
            }
            Distribution::Random => {
                let index = rand::thread_rng().gen_range(0..eligible.len());
                eligible[index]
                    .enqueue(msg, self.timeout_override, registry)
                    .await;
            }
            Distribution::RoundRobin => {
                let index = self.rr_counter.fetch_add(1, Ordering::AcqRel) % eligible.len();
                eligible[index]
                    .enqueue(msg, self.timeout_override, registry)
                    .await;
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("distribution", &self.distribution)
            .field("producers", &self.producer_count())
            .finish()
    }
}

fn read_producers(
    lock: &RwLock<Vec<Arc<ProducerHandle>>>,
) -> std::sync::RwLockReadGuard<'_, Vec<Arc<ProducerHandle>>> {
    match lock.read() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("producer list lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
