use thiserror::Error;

/// Genuine fault conditions raised by the core.
///
/// Per the error-handling design, most abnormal conditions observed in a
/// round (late offers, unmet demand, transmission caps, producer failure)
/// are *not* errors — they are logged events and counters. `CoreError` is
/// reserved for conditions that indicate a bug or a broken invariant.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("malformed wire payload for message type {msg_type}: {reason}")]
    MalformedPayload { msg_type: String, reason: String },

    #[error("negative or zero capacity: {0}")]
    NegativeCapacity(String),

    #[error("round window invalid: {0}")]
    InvalidRoundWindow(String),
}
