//! Error types for the delivery core.
//!
//! The taxonomy follows the propagation policy of the crate:
//!
//! - [`ConnectionError`] — network or authentication failure. Handled
//!   internally with backoff up to the configured retry ceiling, then
//!   surfaced as a terminal failure.
//! - [`ChannelError`] — channel-level problem. Invalidates only the
//!   affected channel; the owner reopens it.
//! - [`PublishError`] — a publish that cannot succeed. Argument errors are
//!   fatal to that call; connection loss is retried internally.
//! - [`HandlerError`] — application failure inside a consumer handler.
//!   Always contained by the worker pool, never terminates the process.
//! - [`UnknownTagError`] — an acknowledgment for a delivery tag the tracker
//!   does not know (already resolved, or from a stale channel epoch).
//!   Logged and ignored, never propagated.

use thiserror::Error;

/// Failure to establish or keep the broker connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The initial TCP/WebSocket connect failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tungstenite::Error,
    },

    /// The broker refused the credential handshake.
    #[error("authentication refused: {0}")]
    AuthRefused(String),

    /// The reconnect ceiling was reached without re-establishing the link.
    #[error("connection retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    /// The session is closed and will not recover.
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Failure scoped to a single channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The broker closed this channel, typically for a protocol-level
    /// misuse such as redeclaring a queue with mismatched properties.
    /// The connection stays up; the owner must reopen the channel.
    #[error("channel closed by broker: {0}")]
    Closed(String),

    /// The channel was opened under a previous connection epoch and was
    /// invalidated by a reconnect. It must be reopened, not reused.
    #[error("channel belongs to a previous connection epoch")]
    Stale,

    /// The underlying connection is gone (lost, recovering, or shut down).
    #[error("connection lost")]
    Disconnected,
}

/// Failure of a single publish call.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Malformed arguments; never retried.
    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Application failure returned by a consumer handler.
///
/// Triggers requeue or dead-lettering per the retry policy; it never
/// crashes the worker pool.
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        HandlerError(msg.to_string())
    }
}

/// An acknowledgment was attempted for a tag the tracker does not hold.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown delivery tag {tag} in channel epoch {epoch}")]
pub struct UnknownTagError {
    pub tag: u64,
    pub epoch: u64,
}
