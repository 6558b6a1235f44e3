use std::fmt;

/// Plugin error — returned by plugin trait methods.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("logic error: {0}")]
    Logic(String),
}

impl PluginError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// Add context to the error, preserving the variant where possible.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        match self {
            PluginError::Config(msg) => PluginError::Config(format!("{ctx}: {msg}")),
            PluginError::Format(msg) => PluginError::Format(format!("{ctx}: {msg}")),
            PluginError::Logic(msg) => PluginError::Logic(format!("{ctx}: {msg}")),
            PluginError::Io(e) => PluginError::Logic(format!("{ctx}: {e}")),
        }
    }
}

/// Sink dispatch error, returned by `ProducerPlugin::on_message`.
///
/// The producer runtime reacts differently to the two variants: a transient
/// failure burns the fuse and reroutes traffic until the fuse is activated
/// again, a fatal failure keeps the producer alive but routes every message
/// to the fallback stream.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transient sink failure: {0}")]
    Transient(String),

    #[error("fatal sink failure: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn transient(msg: impl fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        Self::Fatal(msg.to_string())
    }
}
