//! The `utils` module provides shared definitions used across `duraq`:
//! the error taxonomy and the tracing setup.

pub mod error;
pub mod logging;
