//! Embedded message broker: the queueing engine plus the WebSocket server
//! that exposes it. Used by the `duraq` binary and by the integration
//! tests, which run the whole stack in-process.

pub mod engine;
pub mod peer;
pub mod queue;
pub mod server;

pub use engine::Engine;
pub use server::start_broker_server;
