use thiserror::Error;

/// Errors that can occur when running the Tally CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error reading input or writing output.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// The processor rejected its configuration.
    #[error("aggregate error: {0}")]
    Aggregate(#[from] tally_aggregate::AggregateError),

    /// An output event could not be rendered.
    #[error("event error: {0}")]
    Event(#[from] tally_core::EventError),

    /// A blocking worker panicked or was cancelled.
    #[error("worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
