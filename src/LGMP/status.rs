use thiserror::Error;

/// Transport-level failure conditions.
///
/// `QueueFull` is a retry signal, not a fault: producers spin on it until
/// capacity opens or the host is shutting down. Everything else is either
/// fatal at initialisation time or tells a subscriber to rebind.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The shared region cannot fit the requested allocation.
    #[error("shared region exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// The queue ring is full and the oldest slot still has live pending readers.
    #[error("queue full")]
    QueueFull,

    /// The mapped region failed validation.
    #[error("invalid shared region: {0}")]
    InvalidRegion(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The host restarted; the session id no longer matches and the
    /// subscriber must re-attach.
    #[error("host session changed, rebind required")]
    SessionMismatch,

    /// The host evicted this subscriber for missing its heartbeat.
    #[error("subscriber evicted from queue")]
    Unsubscribed,
}

pub type Result<T> = std::result::Result<T, Error>;
