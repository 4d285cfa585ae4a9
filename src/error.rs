//! Error types for the cache facade.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the cache facade.
///
/// Errors are `Clone` because a single failure may be fanned out to every
/// caller waiting on the same coalesced computation.
#[derive(Debug, Clone)]
pub enum Error {
    /// Encoding a value into a cache payload failed.
    SerializationError(String),

    /// Decoding a cached payload into the requested type failed.
    ///
    /// Common causes:
    /// - Reading a textual value as a number or bool it does not parse as
    /// - Invalid JSON or Postcard bytes
    DeserializationError(String),

    /// Backend storage error (Redis, Memcached, etc).
    ///
    /// This indicates the cache backend is unavailable or returned an error.
    /// Common causes:
    /// - Redis/Memcached connection lost
    /// - Network timeout
    /// - Backend protocol error
    ///
    /// Primitives never retry; the caller decides.
    BackendError(String),

    /// A Lua script was no longer registered on the Redis server.
    ///
    /// The failing call is not retried. A background task re-registers the
    /// script so the next call can succeed.
    ScriptNotLoaded(String),

    /// The lock entry no longer carried this holder's token when released.
    ///
    /// The lease expired (and was possibly taken by another holder) while the
    /// critical section was still running.
    LockLost(String),

    /// The caller that owned a coalesced computation went away before
    /// publishing a result.
    CallAbandoned(String),

    /// A supervised background task panicked or was cancelled.
    TaskFailed(String),

    /// Error returned by a caller-supplied producer.
    ///
    /// Delivered to every coalesced waiter and never cached.
    Producer(String),

    /// Configuration error during initialization.
    ///
    /// Common causes:
    /// - Invalid connection string
    /// - Missing server list
    /// - Watch interval not shorter than the lease
    ConfigError(String),

    /// Operation not supported by the selected backend.
    ///
    /// Memcached has no compare-and-delete primitive, so locking is
    /// unavailable there.
    NotImplemented(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Build a producer error from anything displayable.
    pub fn producer(e: impl fmt::Display) -> Self {
        Error::Producer(e.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::ScriptNotLoaded(msg) => write!(f, "Script not loaded: {}", msg),
            Error::LockLost(name) => write!(f, "Lock lost before release: {}", name),
            Error::CallAbandoned(key) => write!(f, "Shared call abandoned: {}", key),
            Error::TaskFailed(msg) => write!(f, "Background task failed: {}", msg),
            Error::Producer(msg) => write!(f, "Producer error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        match e {
            postcard::Error::SerializeBufferFull
            | postcard::Error::SerializeSeqLengthUnknown
            | postcard::Error::SerdeSerCustom => Error::SerializationError(e.to_string()),
            _ => Error::DeserializationError(e.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}
