//! The `consume` module pulls messages under a prefetch limit, dispatches
//! them to bounded concurrent handlers, and acknowledges each exactly once
//! per channel epoch.
//!
//! The worker pool lives in [`pool`]; the acknowledgment bookkeeping that
//! enforces the at-most-once-ack invariant lives in [`tracker`].

pub mod pool;
pub mod tracker;

pub use pool::{ConsumeOptions, Delivery, Subscription, consume};
pub use tracker::DeliveryTracker;

#[cfg(test)]
mod tests;
