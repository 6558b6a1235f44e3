//! Basic modulators: envelope, copy, and timestamp formatters, stream
//! rerouting and reverting, a regex filter, and a sampling filter.

use std::sync::atomic::{AtomicU64, Ordering};

use regex::bytes::Regex;

use manifold_api::config::PluginConfigReader;
use manifold_api::message::Message;
use manifold_api::modulator::{ApplyTo, ModulateResult, Modulator};
use manifold_api::stream::StreamId;

// ---------------------------------------------------------------------------
// format.Envelope — wrap the addressed bytes in a prefix/postfix
// ---------------------------------------------------------------------------

pub struct EnvelopeFormatter {
    prefix: Vec<u8>,
    postfix: Vec<u8>,
    target: ApplyTo,
}

impl EnvelopeFormatter {
    fn from_config(reader: &mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>> {
        let prefix = reader.get_str("Prefix", "").into_bytes();
        let postfix = reader.get_str("Postfix", "").into_bytes();
        if prefix.is_empty() && postfix.is_empty() {
            reader
                .errors()
                .push("neither 'Prefix' nor 'Postfix' is set, formatter is a no-op");
        }
        Some(Box::new(Self {
            prefix,
            postfix,
            target: ApplyTo::parse(&reader.get_str("ApplyTo", "")),
        }))
    }
}

impl Modulator for EnvelopeFormatter {
    fn modulate(&self, msg: &mut Message) -> ModulateResult {
        let data = self.target.get(msg);
        let mut wrapped = Vec::with_capacity(self.prefix.len() + data.len() + self.postfix.len());
        wrapped.extend_from_slice(&self.prefix);
        wrapped.extend_from_slice(data);
        wrapped.extend_from_slice(&self.postfix);
        self.target.set(msg, wrapped);
        ModulateResult::Accept
    }
}

// ---------------------------------------------------------------------------
// format.Copy — copy bytes between payload and metadata fields
// ---------------------------------------------------------------------------

pub struct CopyFormatter {
    from: ApplyTo,
    to: ApplyTo,
    /// Remove the source metadata field after copying.
    move_source: bool,
}

impl CopyFormatter {
    fn from_config(reader: &mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>> {
        let from = ApplyTo::parse(&reader.get_str("From", ""));
        let to = ApplyTo::parse(&reader.get_str("To", ""));
        if from == to {
            reader
                .errors()
                .push_fatal("'From' and 'To' address the same location");
            return None;
        }
        let mut move_source = reader.get_bool("Move", false);
        if move_source && !matches!(from, ApplyTo::Metadata(_)) {
            reader
                .errors()
                .push("'Move' requires a metadata 'From', ignoring");
            move_source = false;
        }
        Some(Box::new(Self {
            from,
            to,
            move_source,
        }))
    }
}

impl Modulator for CopyFormatter {
    fn modulate(&self, msg: &mut Message) -> ModulateResult {
        let data = self.from.get(msg).to_vec();
        self.to.set(msg, data);
        if self.move_source {
            if let ApplyTo::Metadata(key) = &self.from {
                msg.metadata.remove(key);
            }
        }
        ModulateResult::Accept
    }
}

// ---------------------------------------------------------------------------
// format.Revert — undo the last stream rewrite
// ---------------------------------------------------------------------------

pub struct RevertFormatter;

impl RevertFormatter {
    fn from_config(_reader: &mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>> {
        Some(Box::new(Self))
    }
}

impl Modulator for RevertFormatter {
    fn modulate(&self, msg: &mut Message) -> ModulateResult {
        msg.revert_stream();
        ModulateResult::Accept
    }
}

// ---------------------------------------------------------------------------
// format.Route — rewrite the current stream id
// ---------------------------------------------------------------------------

pub struct RouteFormatter {
    stream_id: StreamId,
}

impl RouteFormatter {
    fn from_config(reader: &mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>> {
        let stream = reader.require_str("Stream");
        let stream_id = StreamId::from_name(&stream);
        if !stream_id.is_valid() {
            reader
                .errors()
                .push_fatal(format!("'Stream': '{stream}' is not a routable stream"));
            return None;
        }
        Some(Box::new(Self { stream_id }))
    }
}

impl Modulator for RouteFormatter {
    fn modulate(&self, msg: &mut Message) -> ModulateResult {
        msg.set_stream(self.stream_id);
        ModulateResult::Accept
    }
}

// ---------------------------------------------------------------------------
// filter.Regex — keep messages whose addressed bytes match
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MismatchAction {
    Drop,
    Reject,
}

pub struct RegexFilter {
    expression: Regex,
    target: ApplyTo,
    on_mismatch: MismatchAction,
}

impl RegexFilter {
    fn from_config(reader: &mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>> {
        let raw = reader.require_str("Expression");
        let expression = match Regex::new(&raw) {
            Ok(re) => re,
            Err(e) => {
                reader
                    .errors()
                    .push_fatal(format!("'Expression': {e}"));
                return None;
            }
        };

        let on_mismatch = match reader.get_str("OnMismatch", "drop").to_ascii_lowercase().as_str() {
            "drop" => MismatchAction::Drop,
            "reject" => MismatchAction::Reject,
            other => {
                reader.errors().push_fatal(format!(
                    "'OnMismatch': expected drop or reject, got '{other}'"
                ));
                return None;
            }
        };

        Some(Box::new(Self {
            expression,
            target: ApplyTo::parse(&reader.get_str("ApplyTo", "")),
            on_mismatch,
        }))
    }
}

impl Modulator for RegexFilter {
    fn modulate(&self, msg: &mut Message) -> ModulateResult {
        if self.expression.is_match(self.target.get(msg)) {
            return ModulateResult::Accept;
        }
        match self.on_mismatch {
            MismatchAction::Drop => ModulateResult::Drop,
            MismatchAction::Reject => ModulateResult::Reject,
        }
    }
}

// ---------------------------------------------------------------------------
// format.Timestamp — prefix the addressed bytes with the message time
// ---------------------------------------------------------------------------

pub struct TimestampFormatter {
    separator: Vec<u8>,
    target: ApplyTo,
}

impl TimestampFormatter {
    fn from_config(reader: &mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>> {
        Some(Box::new(Self {
            separator: reader.get_str("Separator", " ").into_bytes(),
            target: ApplyTo::parse(&reader.get_str("ApplyTo", "")),
        }))
    }
}

impl Modulator for TimestampFormatter {
    fn modulate(&self, msg: &mut Message) -> ModulateResult {
        let stamp = (msg.timestamp_ns() / 1_000_000).to_string();
        let data = self.target.get(msg);
        let mut out = Vec::with_capacity(stamp.len() + self.separator.len() + data.len());
        out.extend_from_slice(stamp.as_bytes());
        out.extend_from_slice(&self.separator);
        out.extend_from_slice(data);
        self.target.set(msg, out);
        ModulateResult::Accept
    }
}

// ---------------------------------------------------------------------------
// filter.Sample — keep every Nth message
// ---------------------------------------------------------------------------

pub struct SampleFilter {
    rate: u64,
    counter: AtomicU64,
}

impl SampleFilter {
    fn from_config(reader: &mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>> {
        let rate = reader.get_int("Rate", 1);
        if rate < 1 {
            reader
                .errors()
                .push_fatal(format!("'Rate' must be at least 1, got {rate}"));
            return None;
        }
        Some(Box::new(Self {
            rate: rate as u64,
            counter: AtomicU64::new(0),
        }))
    }
}

impl Modulator for SampleFilter {
    fn modulate(&self, _msg: &mut Message) -> ModulateResult {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        if seq % self.rate == 0 {
            ModulateResult::Accept
        } else {
            ModulateResult::Drop
        }
    }
}

/// Register every basic modulator under its qualified type name.
pub fn register() {
    manifold_engine::registry::register_modulator(
        "manifold.format.Envelope",
        EnvelopeFormatter::from_config,
    );
    manifold_engine::registry::register_modulator(
        "manifold.format.Copy",
        CopyFormatter::from_config,
    );
    manifold_engine::registry::register_modulator(
        "manifold.format.Route",
        RouteFormatter::from_config,
    );
    manifold_engine::registry::register_modulator(
        "manifold.format.Revert",
        RevertFormatter::from_config,
    );
    manifold_engine::registry::register_modulator(
        "manifold.format.Timestamp",
        TimestampFormatter::from_config,
    );
    manifold_engine::registry::register_modulator(
        "manifold.filter.Regex",
        RegexFilter::from_config,
    );
    manifold_engine::registry::register_modulator(
        "manifold.filter.Sample",
        SampleFilter::from_config,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_api::config::PluginConfig;

    fn build(
        ctor: fn(&mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>>,
        config: PluginConfig,
    ) -> Box<dyn Modulator> {
        let mut reader = PluginConfigReader::new(&config);
        let modulator = ctor(&mut reader).expect("constructor failed");
        assert!(!reader.into_errors().has_fatal());
        modulator
    }

    fn msg(payload: &[u8]) -> Message {
        Message::new(payload.to_vec(), StreamId::from_name("test"))
    }

    #[test]
    fn envelope_wraps_payload() {
        let envelope = build(
            EnvelopeFormatter::from_config,
            PluginConfig::new("format.Envelope")
                .with("Prefix", "[")
                .with("Postfix", "]"),
        );
        let mut m = msg(b"body");
        assert_eq!(envelope.modulate(&mut m), ModulateResult::Accept);
        assert_eq!(m.payload, b"[body]");
    }

    #[test]
    fn envelope_targets_metadata_field() {
        let envelope = build(
            EnvelopeFormatter::from_config,
            PluginConfig::new("format.Envelope")
                .with("Prefix", "host=")
                .with("ApplyTo", "meta:host"),
        );
        let mut m = msg(b"body");
        m.metadata.set("host", "node1");
        envelope.modulate(&mut m);
        assert_eq!(m.metadata.get_bytes("host"), Some(b"host=node1".as_slice()));
        assert_eq!(m.payload, b"body");
    }

    #[test]
    fn copy_moves_payload_into_metadata() {
        let copy = build(
            CopyFormatter::from_config,
            PluginConfig::new("format.Copy").with("To", "meta:raw"),
        );
        let mut m = msg(b"original");
        copy.modulate(&mut m);
        assert_eq!(m.metadata.get_bytes("raw"), Some(b"original".as_slice()));
    }

    #[test]
    fn copy_to_same_location_is_fatal() {
        let config = PluginConfig::new("format.Copy");
        let mut reader = PluginConfigReader::new(&config);
        assert!(CopyFormatter::from_config(&mut reader).is_none());
        assert!(reader.into_errors().has_fatal());
    }

    #[test]
    fn copy_with_move_removes_the_source_field() {
        let copy = build(
            CopyFormatter::from_config,
            PluginConfig::new("format.Copy")
                .with("From", "meta:src")
                .with("To", "meta:dst")
                .with("Move", true),
        );
        let mut m = msg(b"payload");
        m.metadata.set("src", "value");
        copy.modulate(&mut m);

        assert_eq!(m.metadata.get_bytes("dst"), Some(b"value".as_slice()));
        assert!(!m.metadata.contains("src"));
    }

    #[test]
    fn move_from_payload_degrades_to_plain_copy() {
        let config = PluginConfig::new("format.Copy")
            .with("To", "meta:raw")
            .with("Move", true);
        let mut reader = PluginConfigReader::new(&config);
        let copy = CopyFormatter::from_config(&mut reader).expect("constructor failed");
        let errors = reader.into_errors();
        assert!(!errors.is_empty());
        assert!(!errors.has_fatal());

        let mut m = msg(b"original");
        copy.modulate(&mut m);
        assert_eq!(m.payload, b"original");
        assert_eq!(m.metadata.get_bytes("raw"), Some(b"original".as_slice()));
    }

    #[test]
    fn route_rewrites_stream_and_keeps_origin() {
        let route = build(
            RouteFormatter::from_config,
            PluginConfig::new("format.Route").with("Stream", "elsewhere"),
        );
        let mut m = msg(b"x");
        route.modulate(&mut m);
        assert_eq!(m.stream_id(), StreamId::from_name("elsewhere"));
        assert_eq!(m.origin_stream_id(), StreamId::from_name("test"));
        assert_eq!(m.prev_stream_id(), StreamId::from_name("test"));
    }

    #[test]
    fn revert_restores_the_previous_route() {
        let route = build(
            RouteFormatter::from_config,
            PluginConfig::new("format.Route").with("Stream", "detour"),
        );
        let revert = build(
            RevertFormatter::from_config,
            PluginConfig::new("format.Revert"),
        );

        let mut m = msg(b"x");
        route.modulate(&mut m);
        assert_eq!(m.stream_id(), StreamId::from_name("detour"));

        revert.modulate(&mut m);
        assert_eq!(m.stream_id(), StreamId::from_name("test"));
        assert_eq!(m.origin_stream_id(), StreamId::from_name("test"));
    }

    #[test]
    fn regex_filter_drops_mismatches() {
        let filter = build(
            RegexFilter::from_config,
            PluginConfig::new("filter.Regex").with("Expression", "^keep"),
        );
        let mut kept = msg(b"keep this");
        let mut lost = msg(b"discard this");
        assert_eq!(filter.modulate(&mut kept), ModulateResult::Accept);
        assert_eq!(filter.modulate(&mut lost), ModulateResult::Drop);
    }

    #[test]
    fn regex_filter_can_reject_instead() {
        let filter = build(
            RegexFilter::from_config,
            PluginConfig::new("filter.Regex")
                .with("Expression", "^keep")
                .with("OnMismatch", "reject"),
        );
        let mut lost = msg(b"discard this");
        assert_eq!(filter.modulate(&mut lost), ModulateResult::Reject);
    }

    #[test]
    fn bad_expression_is_fatal() {
        let config = PluginConfig::new("filter.Regex").with("Expression", "(unclosed");
        let mut reader = PluginConfigReader::new(&config);
        assert!(RegexFilter::from_config(&mut reader).is_none());
        assert!(reader.into_errors().has_fatal());
    }

    #[test]
    fn timestamp_prefixes_epoch_millis() {
        let stamp = build(
            TimestampFormatter::from_config,
            PluginConfig::new("format.Timestamp"),
        );
        let mut m = msg(b"event");
        stamp.modulate(&mut m);

        let text = String::from_utf8(m.payload.clone()).unwrap();
        let (millis, rest) = text.split_once(' ').expect("separator present");
        assert_eq!(rest, "event");
        assert_eq!(millis.parse::<i64>().unwrap(), m.timestamp_ns() / 1_000_000);
    }

    #[test]
    fn sample_keeps_every_nth() {
        let sample = build(
            SampleFilter::from_config,
            PluginConfig::new("filter.Sample").with("Rate", 3i64),
        );
        let results: Vec<ModulateResult> =
            (0..7).map(|_| sample.modulate(&mut msg(b"x"))).collect();
        assert_eq!(
            results,
            vec![
                ModulateResult::Accept,
                ModulateResult::Drop,
                ModulateResult::Drop,
                ModulateResult::Accept,
                ModulateResult::Drop,
                ModulateResult::Drop,
                ModulateResult::Accept,
            ]
        );
    }

    #[test]
    fn zero_sample_rate_is_fatal() {
        let config = PluginConfig::new("filter.Sample").with("Rate", 0i64);
        let mut reader = PluginConfigReader::new(&config);
        assert!(SampleFilter::from_config(&mut reader).is_none());
        assert!(reader.into_errors().has_fatal());
    }
}
