//! Process-wide plugin type registry.
//!
//! Maps configured type names to constructors. All types are registered at
//! startup, before the first configure call; the registry never sits on the
//! message hot path.

use std::collections::BTreeMap;
use std::sync::{LazyLock, RwLock};

use manifold_api::config::{ErrorStack, PluginConfig, PluginConfigReader};
use manifold_api::modulator::{Modulator, ModulatorChain};
use manifold_api::plugin::{ConsumerPlugin, ProducerPlugin};

use crate::error::EngineError;
use crate::router::Distribution;

pub type ConsumerCtor = fn() -> Box<dyn ConsumerPlugin>;
pub type ProducerCtor = fn() -> Box<dyn ProducerPlugin>;

/// Modulators are constructed directly from their settings; a fatal config
/// problem yields `None` with the reason recorded in the reader's stack.
pub type ModulatorCtor = fn(&mut PluginConfigReader<'_>) -> Option<Box<dyn Modulator>>;

/// Constructor for one registered plugin type.
#[derive(Clone, Copy)]
pub enum PluginCtor {
    Consumer(ConsumerCtor),
    Producer(ProducerCtor),
    Modulator(ModulatorCtor),
    /// Routers are engine-built; the registered value is the distribution
    /// policy the type name stands for.
    Router(Distribution),
}

impl PluginCtor {
    pub fn kind(&self) -> &'static str {
        match self {
            PluginCtor::Consumer(_) => "consumer",
            PluginCtor::Producer(_) => "producer",
            PluginCtor::Modulator(_) => "modulator",
            PluginCtor::Router(_) => "router",
        }
    }
}

/// Registry of plugin type names. Names are package-qualified and matched
/// case-insensitively by suffix, so `producer.File` resolves
/// `manifold.producer.File` as long as the suffix is unambiguous.
#[derive(Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, PluginCtor>,
}

static GLOBAL: LazyLock<RwLock<TypeRegistry>> =
    LazyLock::new(|| RwLock::new(TypeRegistry::with_builtins()));

impl TypeRegistry {
    fn with_builtins() -> Self {
        let mut registry = TypeRegistry::default();
        registry.register("manifold.router.Broadcast", PluginCtor::Router(Distribution::Broadcast));
        registry.register("manifold.router.Random", PluginCtor::Router(Distribution::Random));
        registry.register(
            "manifold.router.RoundRobin",
            PluginCtor::Router(Distribution::RoundRobin),
        );
        registry.register(
            "manifold.consumer.LogBus",
            PluginCtor::Consumer(crate::logbus::new_log_consumer),
        );
        registry
    }

    pub fn register(&mut self, name: &str, ctor: PluginCtor) {
        self.types.insert(name.to_ascii_lowercase(), ctor);
    }

    pub fn resolve(&self, query: &str) -> Result<PluginCtor, EngineError> {
        let query = query.to_ascii_lowercase();
        if let Some(ctor) = self.types.get(&query) {
            return Ok(*ctor);
        }

        let suffix = format!(".{query}");
        let candidates: Vec<&String> = self
            .types
            .keys()
            .filter(|name| name.ends_with(&suffix))
            .collect();

        match candidates.as_slice() {
            [] => Err(EngineError::UnknownType(query)),
            [name] => Ok(self.types[*name]),
            many => Err(EngineError::AmbiguousType {
                query,
                candidates: many.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    pub fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Global access — registration at startup, resolution during configure
// ---------------------------------------------------------------------------

fn read_global() -> std::sync::RwLockReadGuard<'static, TypeRegistry> {
    match GLOBAL.read() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("type registry read lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn write_global() -> std::sync::RwLockWriteGuard<'static, TypeRegistry> {
    match GLOBAL.write() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("type registry write lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub fn register_consumer(name: &str, ctor: ConsumerCtor) {
    write_global().register(name, PluginCtor::Consumer(ctor));
}

pub fn register_producer(name: &str, ctor: ProducerCtor) {
    write_global().register(name, PluginCtor::Producer(ctor));
}

pub fn register_modulator(name: &str, ctor: ModulatorCtor) {
    write_global().register(name, PluginCtor::Modulator(ctor));
}

pub fn resolve(query: &str) -> Result<PluginCtor, EngineError> {
    read_global().resolve(query)
}

/// Drop every non-builtin registration. Intended for process teardown and
/// test isolation.
pub fn clear() {
    *write_global() = TypeRegistry::with_builtins();
}

// ---------------------------------------------------------------------------
// Configured construction
// ---------------------------------------------------------------------------

/// Build an ordered modulator chain from sub-plugin configs, accumulating
/// problems into `errors`. Entries that fail to construct are skipped.
pub fn build_chain(configs: &[PluginConfig], errors: &mut ErrorStack) -> ModulatorChain {
    let mut chain = ModulatorChain::new();
    for config in configs {
        let ctor = match resolve(&config.typename) {
            Ok(PluginCtor::Modulator(ctor)) => ctor,
            Ok(other) => {
                errors.push_fatal(format!(
                    "'{}' is a {} type, expected a modulator",
                    config.typename,
                    other.kind()
                ));
                continue;
            }
            Err(e) => {
                errors.push_fatal(e.to_string());
                continue;
            }
        };

        let mut reader = PluginConfigReader::new(config);
        let modulator = ctor(&mut reader);
        let stack = reader.into_errors();
        for issue in stack.iter() {
            if issue.fatal {
                errors.push_fatal(format!("{}: {}", config.typename, issue.message));
            } else {
                errors.push(format!("{}: {}", config.typename, issue.message));
            }
        }
        if let Some(modulator) = modulator {
            chain.push(modulator);
        }
    }
    chain
}
