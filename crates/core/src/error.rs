use thiserror::Error;

/// Errors raised while reading or building events.
#[derive(Debug, Error)]
pub enum EventError {
    /// Event payloads must be JSON objects.
    #[error("event payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A field exists but does not have the requested type.
    #[error("field '{key}' has an unexpected type: {reason}")]
    TypeMismatch { key: String, reason: String },

    /// The raw payload could not be parsed.
    #[error("invalid event JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised when constructing a token bucket.
#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("events per second must be in (0, {max}], got {value}")]
    InvalidRate { value: u32, max: u32 },
}

/// Errors raised by an expression evaluator.
#[derive(Debug, Error)]
pub enum ExpressionError {
    /// The expression text could not be parsed.
    #[error("invalid expression '{expression}': {reason}")]
    Parse { expression: String, reason: String },

    /// The expression parsed but could not be applied to the event.
    #[error("failed to evaluate '{expression}': {reason}")]
    Evaluation { expression: String, reason: String },
}
