//! Shared utilities for docbatch integration tests.
//!
//! - `TestHarness` wires a file-backed database, a storage backend and a
//!   converter into an orchestrator, and runs batches through the worker pool
//! - `StubConverter` stands in for the external converter process

pub mod harness;

pub use harness::{Backend, StubConverter, TestHarness};
