pub mod config;
pub mod error;
pub mod fuse;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod modulator;
pub mod plugin;
pub mod stream;
pub mod util;
pub mod wire;

pub use config::{ConfigValue, ErrorStack, PluginConfig, PluginConfigReader};
pub use error::{PluginError, SinkError};
pub use fuse::Fuse;
pub use message::Message;
pub use metadata::{Metadata, MetadataValue};
pub use modulator::{ApplyTo, Modulator, ModulatorChain, ModulateResult};
pub use plugin::{
    ConsumerContext, ConsumerPlugin, ControlCommand, PluginState, ProducerPlugin, StateCell,
    StreamDispatch,
};
pub use stream::StreamId;
pub use util::{now_ms, now_ns};
