//! This module contains utilities that are useful for testing code based on sessions and
//!  channels without real sockets. They are used for testing this crate itself, but they are also
//!  exported for application testing.

pub mod memory;
pub mod observer;
