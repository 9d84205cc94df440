//! Deterministic, pure logic shared by client and server.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod decision;
pub mod path;
pub mod types;
