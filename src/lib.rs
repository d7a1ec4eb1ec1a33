//! # duraq
//!
//! `duraq` is a minimal reliable message delivery core: durable queues,
//! persistent messages and at-least-once delivery over a WebSocket
//! transport, with automatic reconnection and bounded-concurrency
//! consumption. It ships an embedded broker so the whole stack can run
//! in-process.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct
//! responsibility:
//!
//! - `wire`: The frame protocol both roles and the broker speak.
//! - `transport`: The session that owns the socket and recovers it with
//!   backoff when the link drops.
//! - `channel`: Lightweight multiplexed channels over one session.
//! - `publish`: The publisher role, with optional broker confirms.
//! - `consume`: The consumer worker pool, delivery tracking and
//!   dead-lettering.
//! - `broker`: The embedded broker engine and its WebSocket server.
//! - `config`: Handles loading and managing configuration.
//! - `utils`: Contains shared utilities, such as error handling and
//!   logging setup.

pub mod broker;
pub mod channel;
pub mod config;
pub mod consume;
pub mod publish;
pub mod transport;
pub mod utils;
pub mod wire;

#[cfg(test)]
mod tests;
