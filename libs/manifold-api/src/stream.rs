use std::fmt;

use xxhash_rust::const_xxh3::xxh3_64;

/// Name of the wildcard stream. Producers bound to it receive traffic from
/// every non-internal stream.
pub const WILDCARD_STREAM: &str = "*";

/// Name of the internal log stream. Log events are emitted here when an
/// internal log consumer is attached.
pub const INTERNAL_LOG_STREAM: &str = "_MANIFOLD_";

/// Name of the built-in fallback stream. Messages that can neither be
/// routed nor dropped explicitly end up here.
pub const FALLBACK_STREAM: &str = "_FALLBACK_";

/// Name reserved for the invalid stream (id 0). Never routable.
pub const INVALID_STREAM: &str = "_INVALID_";

/// Stable 64-bit stream identifier, derived from the stream name.
///
/// The hash (xxh3) is stable across runs and platforms, so ids can be
/// persisted inside serialized messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub const INVALID: StreamId = StreamId(0);
    pub const WILDCARD: StreamId = StreamId(xxh3_64(WILDCARD_STREAM.as_bytes()));
    pub const INTERNAL_LOG: StreamId = StreamId(xxh3_64(INTERNAL_LOG_STREAM.as_bytes()));
    pub const FALLBACK: StreamId = StreamId(xxh3_64(FALLBACK_STREAM.as_bytes()));

    /// Hash a stream name into its id. The empty name and `_INVALID_` map
    /// to [`StreamId::INVALID`].
    pub fn from_name(name: &str) -> Self {
        if name.is_empty() || name == INVALID_STREAM {
            return StreamId::INVALID;
        }
        StreamId(xxh3_64(name.as_bytes()))
    }

    pub fn is_valid(self) -> bool {
        self != StreamId::INVALID
    }

    /// Internal streams are excluded from wildcard fan-out.
    pub fn is_internal(self) -> bool {
        self == StreamId::INTERNAL_LOG || self == StreamId::FALLBACK
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({:#018x})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_across_calls() {
        assert_eq!(StreamId::from_name("access-log"), StreamId::from_name("access-log"));
        assert_ne!(StreamId::from_name("access-log"), StreamId::from_name("error-log"));
    }

    #[test]
    fn named_constants_match_their_names() {
        assert_eq!(StreamId::from_name(WILDCARD_STREAM), StreamId::WILDCARD);
        assert_eq!(StreamId::from_name(INTERNAL_LOG_STREAM), StreamId::INTERNAL_LOG);
        assert_eq!(StreamId::from_name(FALLBACK_STREAM), StreamId::FALLBACK);
    }

    #[test]
    fn empty_and_reserved_names_are_invalid() {
        assert_eq!(StreamId::from_name(""), StreamId::INVALID);
        assert_eq!(StreamId::from_name(INVALID_STREAM), StreamId::INVALID);
        assert!(!StreamId::INVALID.is_valid());
    }

    #[test]
    fn internal_streams_are_flagged() {
        assert!(StreamId::INTERNAL_LOG.is_internal());
        assert!(StreamId::FALLBACK.is_internal());
        assert!(!StreamId::from_name("user").is_internal());
    }
}
