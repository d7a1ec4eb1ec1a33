//! The `channel` module provides the lightweight sub-connections that
//! carry flow-controlled message traffic over a [`Session`].
//!
//! A channel declares queues idempotently, bounds unacknowledged
//! deliveries through its prefetch credit, and is invalidated (not
//! destroyed) when the underlying connection recovers: its owner must
//! reopen it under the new epoch.
//!
//! [`Session`]: crate::transport::Session

pub mod mux;

pub use mux::Channel;
