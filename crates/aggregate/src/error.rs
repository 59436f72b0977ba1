use thiserror::Error;

/// Errors raised while configuring or running aggregation.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The processor or an action was misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An event field could not be used by the action.
    #[error("invalid field '{key}': {reason}")]
    InvalidField { key: String, reason: String },

    /// A condition could not be parsed or evaluated.
    #[error("expression error: {0}")]
    Expression(#[from] tally_core::ExpressionError),

    /// An event could not be read or built.
    #[error("event error: {0}")]
    Event(#[from] tally_core::EventError),

    /// A token bucket could not be built.
    #[error("throttle error: {0}")]
    Throttle(#[from] tally_core::ThrottleError),

    /// An output record could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
