//! Utilities for testing code that uses servers and clients. They are used for testing this crate
//!  itself, but they are also exported for application testing.

pub mod handler;
pub mod net;
