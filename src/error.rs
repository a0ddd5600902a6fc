//! Error types for the Starlight Hub.

use thiserror::Error;

/// Result type for Hub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while the Hub is running.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame failed to parse as JSON-RPC 2.0 with a recognized method.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Registration was rejected (bad or missing auth token).
    #[error("authorization rejected: {0}")]
    Unauthorized(String),

    /// A semantic goal could not be resolved to a selector.
    #[error("could not find element matching goal {0:?}")]
    Resolution(String),

    /// PageDriver verb execution failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A Sentinel vetoed (replied `wait`).
    #[error("vetoed: retry after {retry_after_ms}ms")]
    Vetoed { retry_after_ms: u64 },

    /// Lock operation was rejected (priority too low, not owner, etc).
    #[error("lock error: {0}")]
    Lock(String),

    /// A critical Sentinel's heartbeat has lapsed; the system is unhealthy.
    #[error("system unhealthy: {0}")]
    Unhealthy(String),

    /// Mission-wide timeout elapsed.
    #[error("mission timeout after {0}ms")]
    MissionTimeout(u64),

    /// Persistence (trace/report/memory/ghost) failed to write.
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JWT error, surfaced by the auth validator's JWT fallback.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The page driver has not been launched yet.
    #[error("page driver not initialized")]
    DriverNotReady,

    /// Generic configuration problem.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Connection closed unexpectedly (participant dropped mid-operation).
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Internal channel send error (a receiver was dropped).
    #[error("internal channel error")]
    ChannelError,
}
