//! Errors delivered through `Subscriber::fail`.

/// Failure signal carried from a publisher to its subscriber.
///
/// `Clone` because a hot source broadcasts the same failure to every
/// subscriber it has.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// `request(n)` was called with `n == 0`.
    #[error("invalid demand: request({0}) must be positive")]
    InvalidDemand(u64),

    /// A subscriber callback refused a value.
    #[error("subscriber rejected value: {0}")]
    Rejected(String),

    /// An operator function failed while transforming a value.
    #[error("operator failed: {0}")]
    Operator(String),

    /// The producing side failed.
    #[error("source failed: {0}")]
    Source(String),
}

impl StreamError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        StreamError::Rejected(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        StreamError::Source(msg.into())
    }
}
