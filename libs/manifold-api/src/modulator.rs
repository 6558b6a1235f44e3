use crate::message::Message;
use crate::metadata::MetadataValue;

/// Outcome of applying one modulator to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulateResult {
    /// Keep processing. Formatters always accept after mutating.
    Accept,
    /// Stop processing and destroy the message.
    Drop,
    /// Stop processing; the enclosing plugin routes the message to its
    /// fallback stream.
    Reject,
}

/// A formatter or filter element of a processing chain.
///
/// Formatters mutate payload, metadata, or the current stream id and return
/// `Accept`. Filters leave the message alone and decide its fate.
pub trait Modulator: Send + Sync {
    fn modulate(&self, msg: &mut Message) -> ModulateResult;
}

/// Ordered modulator chain. Execution is strictly in declaration order;
/// the first `Drop` or `Reject` terminates the chain.
#[derive(Default)]
pub struct ModulatorChain {
    entries: Vec<Box<dyn Modulator>>,
}

impl ModulatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, modulator: Box<dyn Modulator>) {
        self.entries.push(modulator);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&self, msg: &mut Message) -> ModulateResult {
        for entry in &self.entries {
            match entry.modulate(msg) {
                ModulateResult::Accept => {}
                stop => return stop,
            }
        }
        ModulateResult::Accept
    }
}

impl std::fmt::Debug for ModulatorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModulatorChain")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Where a formatter reads its input from and writes its output to.
///
/// Declared in configuration (`ApplyTo: ""` for the payload, `ApplyTo:
/// "meta:key"` or `ApplyTo: "key"` for a metadata field), not in code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyTo {
    Payload,
    Metadata(String),
}

impl ApplyTo {
    pub fn parse(option: &str) -> Self {
        let trimmed = option.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("payload") {
            return ApplyTo::Payload;
        }
        match trimmed.strip_prefix("meta:") {
            Some(key) => ApplyTo::Metadata(key.to_string()),
            None => ApplyTo::Metadata(trimmed.to_string()),
        }
    }

    /// Read the addressed bytes. A missing metadata field reads as empty.
    pub fn get<'a>(&self, msg: &'a Message) -> &'a [u8] {
        match self {
            ApplyTo::Payload => &msg.payload,
            ApplyTo::Metadata(key) => msg.metadata.get_bytes(key).unwrap_or(&[]),
        }
    }

    /// Replace the addressed bytes.
    pub fn set(&self, msg: &mut Message, data: Vec<u8>) {
        match self {
            ApplyTo::Payload => msg.payload = data,
            ApplyTo::Metadata(key) => msg.metadata.set(key.clone(), MetadataValue::Bytes(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamId;

    struct Upper(ApplyTo);

    impl Modulator for Upper {
        fn modulate(&self, msg: &mut Message) -> ModulateResult {
            let data = self.0.get(msg).to_ascii_uppercase();
            self.0.set(msg, data);
            ModulateResult::Accept
        }
    }

    struct DropAll;

    impl Modulator for DropAll {
        fn modulate(&self, _msg: &mut Message) -> ModulateResult {
            ModulateResult::Drop
        }
    }

    #[test]
    fn chain_runs_in_declaration_order_and_stops_at_drop() {
        let mut chain = ModulatorChain::new();
        chain.push(Box::new(Upper(ApplyTo::Payload)));
        chain.push(Box::new(DropAll));
        chain.push(Box::new(Upper(ApplyTo::Metadata("k".to_string()))));

        let mut msg = Message::new(b"abc".to_vec(), StreamId::from_name("s"));
        msg.metadata.set("k", "x");

        assert_eq!(chain.apply(&mut msg), ModulateResult::Drop);
        // First formatter ran, third never did.
        assert_eq!(msg.payload, b"ABC");
        assert_eq!(msg.metadata.get_bytes("k"), Some(b"x".as_slice()));
    }

    #[test]
    fn apply_to_parses_config_forms() {
        assert_eq!(ApplyTo::parse(""), ApplyTo::Payload);
        assert_eq!(ApplyTo::parse("payload"), ApplyTo::Payload);
        assert_eq!(ApplyTo::parse("meta:host"), ApplyTo::Metadata("host".to_string()));
        assert_eq!(ApplyTo::parse("host"), ApplyTo::Metadata("host".to_string()));
    }

    #[test]
    fn metadata_target_reads_and_writes() {
        let target = ApplyTo::Metadata("field".to_string());
        let mut msg = Message::new(b"payload".to_vec(), StreamId::from_name("s"));

        assert!(target.get(&msg).is_empty());
        target.set(&mut msg, b"value".to_vec());
        assert_eq!(target.get(&msg), b"value");
        assert_eq!(msg.payload, b"payload");
    }
}
