//! The `transport` module owns the logical connection to the broker.
//!
//! A [`Session`] holds the socket behind a single background task that
//! serializes all outbound traffic, routes inbound frames to their
//! channels, and recovers from disconnection with jittered exponential
//! backoff. Lifecycle events let the publisher and the consumer pool
//! recreate their channels after a recovery.

pub mod backoff;
pub mod event;
pub mod session;

pub use backoff::ReconnectBackoff;
pub use event::{ConnectionState, SessionEvent};
pub use session::{Endpoint, Session, SessionOptions};
