//! Deterministic, pure logic shared by the relay and pipeline runners.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod completion;
pub mod dag;
pub mod knowledge;
pub mod rate_limit;
pub mod similarity;
pub mod stream;
pub mod types;
