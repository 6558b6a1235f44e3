//! Stream registry — the process-wide lookup from stream id to router.
//!
//! Reads sit on the hot routing path; writes happen during configure and
//! on lazy fallback creation only. Guarded by a reader-writer lock with
//! poisoned-lock recovery.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use manifold_api::message::Message;
use manifold_api::metrics::{Metric, MetricsProvider};
use manifold_api::plugin::StreamDispatch;
use manifold_api::stream::StreamId;

use crate::error::EngineError;
use crate::metric_names;
use crate::producer::ProducerHandle;
use crate::router::{Distribution, Router};

pub struct StreamRegistry {
    routers: RwLock<HashMap<StreamId, Arc<Router>>>,
    names: RwLock<HashMap<StreamId, String>>,
    wildcard_producers: RwLock<Vec<Arc<ProducerHandle>>>,
    wildcard_finalized: AtomicBool,
    max_fallback_depth: u32,

    metrics: Arc<dyn MetricsProvider>,
    m_dropped: Arc<dyn Metric>,
    m_fallback_routed: Arc<dyn Metric>,
    m_fallback_loop_dropped: Arc<dyn Metric>,
}

impl StreamRegistry {
    pub fn new(metrics: Arc<dyn MetricsProvider>, max_fallback_depth: u32) -> Arc<Self> {
        let m_dropped = metrics.metric(metric_names::DROPPED);
        let m_fallback_routed = metrics.metric(metric_names::FALLBACK_ROUTED);
        let m_fallback_loop_dropped = metrics.metric(metric_names::FALLBACK_LOOP_DROPPED);
        Arc::new(Self {
            routers: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            wildcard_producers: RwLock::new(Vec::new()),
            wildcard_finalized: AtomicBool::new(false),
            max_fallback_depth,
            metrics,
            m_dropped,
            m_fallback_routed,
            m_fallback_loop_dropped,
        })
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsProvider> {
        &self.metrics
    }

    /// Hash a stream name and remember it for reverse lookup.
    pub fn intern_name(&self, name: &str) -> StreamId {
        let id = StreamId::from_name(name);
        if id.is_valid() {
            let mut guard = write_recover(&self.names, "stream names");
            guard.entry(id).or_insert_with(|| name.to_string());
        }
        id
    }

    /// Human-readable name of a stream, the raw id when unknown.
    pub fn stream_name(&self, id: StreamId) -> String {
        let guard = read_recover(&self.names, "stream names");
        guard.get(&id).cloned().unwrap_or_else(|| id.to_string())
    }

    /// Register a configured router. Two registrations for the same
    /// concrete stream are an error.
    pub fn register(&self, router: Router) -> Result<Arc<Router>, EngineError> {
        let id = router.stream_id();
        let mut guard = write_recover(&self.routers, "stream registry");
        if let Some(existing) = guard.get(&id) {
            if !existing.is_auto_created() {
                return Err(EngineError::StreamTaken(self.stream_name(id)));
            }
        }
        let router = Arc::new(router);
        guard.insert(id, router.clone());
        Ok(router)
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Router>> {
        read_recover(&self.routers, "stream registry").get(&id).cloned()
    }

    pub fn router_count(&self) -> usize {
        read_recover(&self.routers, "stream registry").len()
    }

    /// Registered router for `id`, or a lazily created default broadcast
    /// router bound to that stream.
    ///
    /// Routers created after wildcard finalization receive the wildcard
    /// producer set immediately.
    pub fn get_or_create(self: &Arc<Self>, id: StreamId) -> Arc<Router> {
        if let Some(router) = self.get(id) {
            return router;
        }

        let mut guard = write_recover(&self.routers, "stream registry");
        if let Some(router) = guard.get(&id) {
            return router.clone();
        }

        let name = self.stream_name(id);
        tracing::debug!(stream = %name, "creating fallback broadcast router");
        let router = Arc::new(Router::auto(
            name,
            id,
            Distribution::Broadcast,
            self.metrics.as_ref(),
        ));
        if self.wildcard_finalized.load(Ordering::Acquire) && !id.is_internal() {
            let wildcard = read_recover(&self.wildcard_producers, "wildcard producers");
            for producer in wildcard.iter() {
                router.add_producer(producer.clone());
            }
        }
        guard.insert(id, router.clone());
        router
    }

    /// Remember a producer bound to `*`. It joins every router at
    /// finalization time.
    pub fn register_wildcard_producer(&self, producer: Arc<ProducerHandle>) {
        write_recover(&self.wildcard_producers, "wildcard producers").push(producer);
    }

    /// Attach the wildcard producer set to every known non-internal
    /// router. Called exactly once, after configure and before any worker
    /// starts.
    pub fn finalize_wildcard(&self) {
        let wildcard = read_recover(&self.wildcard_producers, "wildcard producers").clone();
        if self.wildcard_finalized.swap(true, Ordering::AcqRel) {
            tracing::warn!("wildcard producers finalized twice");
        }
        if wildcard.is_empty() {
            return;
        }
        let routers = read_recover(&self.routers, "stream registry");
        for router in routers.values() {
            if router.stream_id().is_internal() {
                continue;
            }
            for producer in &wildcard {
                router.add_producer(producer.clone());
            }
        }
    }

    /// Route a message to the router bound to its current stream.
    pub async fn dispatch(self: &Arc<Self>, msg: Message) {
        let router = self.get_or_create(msg.stream_id());
        router.enqueue(self, msg).await;
    }

    /// Boxed [`dispatch`](Self::dispatch) for re-entrant paths (formatter
    /// reroutes, fallback routing); keeps the future types finite.
    pub fn dispatch_boxed<'a>(
        self: &'a Arc<Self>,
        msg: Message,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.dispatch(msg))
    }

    /// Reroute a message that would otherwise be lost.
    ///
    /// The depth bound breaks fallback loops; exceeding it discards the
    /// message and counts it. An invalid fallback id counts the message as
    /// dropped.
    pub fn route_to_fallback<'a>(
        self: &'a Arc<Self>,
        mut msg: Message,
        fallback_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if !fallback_id.is_valid() {
                self.m_dropped.inc();
                return;
            }

            let hops = msg.count_fallback_hop();
            if hops > self.max_fallback_depth {
                tracing::warn!(
                    stream = %self.stream_name(msg.stream_id()),
                    hops,
                    "fallback depth exceeded, discarding message"
                );
                self.m_fallback_loop_dropped.inc();
                return;
            }

            msg.set_stream(fallback_id);
            self.m_fallback_routed.inc();
            self.dispatch_boxed(msg).await;
        })
    }

    /// Count a message as lost. Used by routers when the fallback chain
    /// terminates without an accepting route.
    pub fn note_dropped(&self) {
        self.m_dropped.inc();
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("routers", &self.router_count())
            .finish()
    }
}

/// Thin wrapper so [`StreamDispatch`] (defined in `manifold-api`) can be
/// implemented for an `Arc<StreamRegistry>` without running afoul of the
/// orphan rules (neither the trait nor `Arc` are local to this crate).
pub struct RegistryDispatch(pub Arc<StreamRegistry>);

#[async_trait]
impl StreamDispatch for RegistryDispatch {
    async fn dispatch(&self, msg: Message) {
        StreamRegistry::dispatch(&self.0, msg).await;
    }
}

// ---------------------------------------------------------------------------
// Poisoned-lock recovery helpers
// ---------------------------------------------------------------------------

fn read_recover<'a, T>(lock: &'a RwLock<T>, what: &str) -> std::sync::RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("{what} read lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn write_recover<'a, T>(lock: &'a RwLock<T>, what: &str) -> std::sync::RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("{what} write lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
