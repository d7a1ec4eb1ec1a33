//! The `wire` module defines the frame protocol spoken between the
//! delivery core and the broker, and the shared queue vocabulary.
//!
//! Frames are JSON-encoded tagged enums carried over WebSocket text
//! messages. Everything after the credential handshake is multiplexed by a
//! numeric channel id carried on each frame.

pub mod frame;
pub mod queue;

pub use frame::Frame;
pub use queue::{QueueDescriptor, dead_letter_queue};

#[cfg(test)]
mod tests;
