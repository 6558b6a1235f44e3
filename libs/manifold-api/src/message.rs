use crate::metadata::Metadata;
use crate::stream::StreamId;
use crate::util::now_ns;

/// Unit of data flowing through the pipeline.
///
/// A message is owned by exactly one stage at a time; handoff happens
/// through channels. Payload and metadata are mutable only by the modulator
/// chain currently processing the message. Cloning duplicates payload bytes
/// and metadata, so broadcast copies are independently mutable.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Vec<u8>,
    pub metadata: Metadata,

    origin_stream_id: StreamId,
    stream_id: StreamId,
    prev_stream_id: StreamId,
    timestamp_ns: i64,

    /// Number of fallback reroutes this message has survived. Runtime
    /// bookkeeping only — never serialized.
    fallback_hops: u32,
}

impl Message {
    /// Create a message addressed to `stream_id`, stamped with the current
    /// wall-clock time.
    pub fn new(payload: Vec<u8>, stream_id: StreamId) -> Self {
        Self {
            payload,
            metadata: Metadata::new(),
            origin_stream_id: stream_id,
            stream_id,
            prev_stream_id: stream_id,
            timestamp_ns: now_ns(),
            fallback_hops: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reconstruct a message from its persisted fields (wire codec only).
    pub(crate) fn from_parts(
        payload: Vec<u8>,
        metadata: Metadata,
        origin_stream_id: StreamId,
        stream_id: StreamId,
        prev_stream_id: StreamId,
        timestamp_ns: i64,
    ) -> Self {
        Self {
            payload,
            metadata,
            origin_stream_id,
            stream_id,
            prev_stream_id,
            timestamp_ns,
            fallback_hops: 0,
        }
    }

    /// The stream the consumer initially published to. Never changes.
    pub fn origin_stream_id(&self) -> StreamId {
        self.origin_stream_id
    }

    /// The stream currently being processed.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// The value of the current stream id before the last rewrite.
    pub fn prev_stream_id(&self) -> StreamId {
        self.prev_stream_id
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    pub fn fallback_hops(&self) -> u32 {
        self.fallback_hops
    }

    /// Reroute the message, remembering the previous stream id.
    pub fn set_stream(&mut self, stream_id: StreamId) {
        self.prev_stream_id = self.stream_id;
        self.stream_id = stream_id;
    }

    /// Undo the last reroute.
    pub fn revert_stream(&mut self) {
        self.stream_id = self.prev_stream_id;
    }

    /// Pin the origin stream to the current stream id. Called exactly once
    /// by the consumer runtime, after the consumer chain has run.
    pub fn freeze_origin(&mut self) {
        self.origin_stream_id = self.stream_id;
        self.prev_stream_id = self.stream_id;
    }

    /// Count one fallback reroute against this message.
    pub fn count_fallback_hop(&mut self) -> u32 {
        self.fallback_hops += 1;
        self.fallback_hops
    }
}
