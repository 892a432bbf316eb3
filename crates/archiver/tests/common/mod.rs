//! Shared test utilities for archiver integration tests.
//!
//! `TestPipeline` wires a file-backed database, a manual clock and an
//! auditor so tests can drive records through the pipeline and move time
//! deterministically.

pub mod harness;

pub use harness::TestPipeline;
