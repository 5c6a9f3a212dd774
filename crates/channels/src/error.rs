//! Dispatch error type.

use thiserror::Error;

/// Errors returned by a channel adapter's `dispatch` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Transient`: re-dispatched after an exponential back-off delay, until
///   the retry budget is spent.
/// - `Rejected`: the trigger instance is immediately marked as failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The transport is temporarily unavailable; the engine should retry.
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    /// The transport refused the message (bad recipient, policy, ...).
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
