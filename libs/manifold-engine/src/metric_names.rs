//! Metric names published by the core.

pub const ACTIVE_PRODUCERS: &str = "producers.active";
pub const ACTIVE_CONSUMERS: &str = "consumers.active";

/// Messages lost with no fallback route left.
pub const DROPPED: &str = "messages.dropped";
/// Messages a filter chain dropped on purpose.
pub const FILTERED: &str = "messages.filtered";
/// Messages discarded as unusable (oversized for a batch, unserializable).
pub const DISCARDED: &str = "messages.discarded";
/// Messages rerouted to a fallback stream.
pub const FALLBACK_ROUTED: &str = "messages.fallback_routed";
/// Messages discarded because they exceeded the fallback depth bound.
pub const FALLBACK_LOOP_DROPPED: &str = "messages.fallback_loop_dropped";

/// Per-stream throughput counter.
pub fn stream_routed(stream: &str) -> String {
    format!("streams.{stream}.routed")
}
