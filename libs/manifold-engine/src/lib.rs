pub mod batch;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod logbus;
pub mod metric_names;
pub mod producer;
pub mod registry;
pub mod router;
pub mod streams;

pub use batch::{AppendResult, MessageBatch};
pub use config::{CoordinatorSettings, EngineConfig, NamedPlugin};
pub use consumer::{ConsumerRuntime, ConsumerSettings, ConsumerSpec};
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorState, RunSignal};
pub use error::EngineError;
pub use producer::{
    ProducerHandle, ProducerRuntime, ProducerSettings, ProducerSpec, TimeoutPolicy,
};
pub use router::{Distribution, Router};
pub use streams::StreamRegistry;
