use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PluginConfigReader;
use crate::error::{PluginError, SinkError};
use crate::message::Message;
use crate::metadata::Metadata;
use crate::modulator::{ModulateResult, ModulatorChain};
use crate::stream::StreamId;

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PluginState {
    Initializing = 0,
    Active = 1,
    Waiting = 2,
    Stopping = 3,
    Dead = 4,
}

impl PluginState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PluginState::Initializing,
            1 => PluginState::Active,
            2 => PluginState::Waiting,
            3 => PluginState::Stopping,
            _ => PluginState::Dead,
        }
    }
}

/// Lock-free state cell shared between a plugin's workers and everyone
/// observing it (routers skip producers in `Stopping`/`Dead`).
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(PluginState::Initializing as u8),
        }
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: PluginState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the plugin still accepts messages.
    pub fn accepts_messages(&self) -> bool {
        !matches!(self.get(), PluginState::Stopping | PluginState::Dead)
    }
}

/// Asynchronous control command delivered out-of-band to plugin workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Begin graceful shutdown.
    Stop,
    /// Reopen or rotate external resources (typically SIGHUP).
    Roll,
}

// ---------------------------------------------------------------------------
// Producer plugin — sink-side dispatch interface
// ---------------------------------------------------------------------------

/// Sink-specific part of a producer. The runtime owns the inbound channel,
/// control loop, modulator chains, fuse, and shutdown handling; the plugin
/// only implements dispatch.
#[async_trait]
pub trait ProducerPlugin: Send {
    /// Read settings. Problems are recorded in the reader's error stack;
    /// a fatal entry rejects the plugin.
    fn configure(&mut self, reader: &mut PluginConfigReader<'_>);

    /// Receive the coordinator's metrics provider. Called once after
    /// `configure`; plugins without metrics ignore it.
    fn attach_metrics(&mut self, metrics: Arc<dyn crate::metrics::MetricsProvider>) {
        let _ = metrics;
    }

    /// Handle one message that passed the chains. The runtime keeps
    /// ownership so it can reroute the message to the fallback stream when
    /// this returns an error; errors distinguish transient failures (burn
    /// the fuse) from fatal ones.
    async fn on_message(&mut self, msg: &Message) -> Result<(), SinkError>;

    /// Periodic callback, armed by [`tick_interval`](Self::tick_interval).
    /// The next tick is scheduled after this returns; ticks never overlap.
    async fn on_tick(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Rotate or reopen external resources.
    async fn on_roll(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once when shutdown begins, before the inbound channel is
    /// drained.
    async fn on_stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}

// ---------------------------------------------------------------------------
// Consumer plugin — source-side ingest interface
// ---------------------------------------------------------------------------

/// Source-specific part of a consumer. `run` is spawned once per configured
/// worker; implementations with worker state keep it behind atomics or
/// locks.
#[async_trait]
pub trait ConsumerPlugin: Send + Sync {
    fn configure(&mut self, reader: &mut PluginConfigReader<'_>);

    /// Ingest until cancelled. Messages are produced through
    /// [`ConsumerContext::emit`].
    async fn run(&self, ctx: ConsumerContext, cancel: CancellationToken)
    -> Result<(), PluginError>;

    /// Reopen or rotate external resources.
    async fn on_roll(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer context — emit helper wired to the stream registry
// ---------------------------------------------------------------------------

/// Routing entry point handed to consumer contexts. Implemented by the
/// engine's stream registry; dispatch covers fallback routing.
#[async_trait]
pub trait StreamDispatch: Send + Sync {
    async fn dispatch(&self, msg: Message);
}

/// Per-consumer emit helper.
///
/// `emit` stamps the timestamp, runs the consumer-side chain, pins the
/// origin stream id to the post-chain stream, and dispatches.
#[derive(Clone)]
pub struct ConsumerContext {
    streams: Arc<[StreamId]>,
    chain: Arc<ModulatorChain>,
    dispatch: Arc<dyn StreamDispatch>,
}

impl ConsumerContext {
    pub fn new(
        streams: Arc<[StreamId]>,
        chain: Arc<ModulatorChain>,
        dispatch: Arc<dyn StreamDispatch>,
    ) -> Self {
        Self {
            streams,
            chain,
            dispatch,
        }
    }

    /// Emit one payload to a specific stream. Returns `false` when the
    /// consumer chain dropped or rejected the message.
    pub async fn emit_to(
        &self,
        stream_id: StreamId,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> bool {
        let mut msg = Message::new(payload, stream_id).with_metadata(metadata);
        match self.chain.apply(&mut msg) {
            ModulateResult::Accept => {}
            // Nothing downstream owns the message yet, so a consumer-side
            // reject degrades to a drop.
            ModulateResult::Drop | ModulateResult::Reject => {
                tracing::debug!(stream = %stream_id, "consumer chain dropped message");
                return false;
            }
        }
        msg.freeze_origin();
        self.dispatch.dispatch(msg).await;
        true
    }

    /// Emit one payload to every bound stream.
    pub async fn emit(&self, payload: Vec<u8>, metadata: Metadata) {
        let Some((last, rest)) = self.streams.split_last() else {
            return;
        };
        for stream in rest {
            self.emit_to(*stream, payload.clone(), metadata.clone()).await;
        }
        self.emit_to(*last, payload, metadata).await;
    }
}

impl std::fmt::Debug for ConsumerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerContext")
            .field("streams", &self.streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulator::Modulator;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl StreamDispatch for Recorder {
        async fn dispatch(&self, msg: Message) {
            self.seen.lock().await.push(msg);
        }
    }

    struct Reroute(StreamId);

    impl Modulator for Reroute {
        fn modulate(&self, msg: &mut Message) -> ModulateResult {
            msg.set_stream(self.0);
            ModulateResult::Accept
        }
    }

    #[tokio::test]
    async fn emit_pins_origin_after_chain() {
        let rerouted = StreamId::from_name("rerouted");
        let mut chain = ModulatorChain::new();
        chain.push(Box::new(Reroute(rerouted)));

        let recorder = Arc::new(Recorder::default());
        let ctx = ConsumerContext::new(
            Arc::from(vec![StreamId::from_name("bound")].into_boxed_slice()),
            Arc::new(chain),
            recorder.clone(),
        );

        assert!(ctx.emit_to(StreamId::from_name("bound"), b"x".to_vec(), Metadata::new()).await);

        let seen = recorder.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].stream_id(), rerouted);
        assert_eq!(seen[0].origin_stream_id(), rerouted);
    }

    #[tokio::test]
    async fn emit_fans_out_to_every_bound_stream() {
        let streams = vec![StreamId::from_name("a"), StreamId::from_name("b")];
        let recorder = Arc::new(Recorder::default());
        let ctx = ConsumerContext::new(
            Arc::from(streams.clone().into_boxed_slice()),
            Arc::new(ModulatorChain::new()),
            recorder.clone(),
        );

        ctx.emit(b"hello".to_vec(), Metadata::new()).await;

        let seen = recorder.seen.lock().await;
        let mut ids: Vec<_> = seen.iter().map(|m| m.stream_id()).collect();
        ids.sort();
        let mut want = streams;
        want.sort();
        assert_eq!(ids, want);
    }

    #[test]
    fn state_cell_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), PluginState::Initializing);
        assert!(cell.accepts_messages());
        cell.set(PluginState::Stopping);
        assert!(!cell.accepts_messages());
        cell.set(PluginState::Dead);
        assert_eq!(cell.get(), PluginState::Dead);
    }
}
