//! Error taxonomy for channel operations.
//!
//! A single `EventError` enum covers every failure the crate can surface.
//! The enum is `Clone` because a terminal failure is delivered to every
//! subscriber of a channel and cached as the controller's last error.

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventError {
    /// A value was sent whose type has no registered codec.
    ///
    /// Raised at the controller boundary before any state is mutated.
    #[error("Unsupported event type: {0}")]
    UnsupportedType(String),

    /// A subscriber was handed more values than it requested credits for.
    ///
    /// Delivered to the violating subscriber only, which is then removed.
    #[error("Backpressure violation: {produced} produced with only {requested} requested")]
    BackpressureViolation { requested: u64, produced: u64 },

    /// An incoming envelope could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The transport rejected or lost an operation.
    #[error("Transport failed: {0}")]
    Transport(String),

    /// Operation on a controller or proxy that was already closed.
    #[error("Channel already closed")]
    Closed,

    /// Producer-supplied failure propagated through `fail()`.
    #[error("Stream failed: {0}")]
    Stream(String),
}
