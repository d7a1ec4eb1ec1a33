//! The `publish` module turns application messages into durable,
//! acknowledged publishes on a named queue.

pub mod publisher;

pub use publisher::{PublishReceipt, Publisher};
