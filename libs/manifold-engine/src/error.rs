#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown plugin type: '{0}'")]
    UnknownType(String),

    #[error("ambiguous plugin type '{query}': matches {candidates:?}")]
    AmbiguousType {
        query: String,
        candidates: Vec<String>,
    },

    #[error("stream '{0}' is already bound to a router")]
    StreamTaken(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
