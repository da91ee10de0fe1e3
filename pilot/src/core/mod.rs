//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod compaction;
pub mod fanout;
pub mod heuristics;
pub mod loop_detect;
pub mod routing;
pub mod safety;
pub mod signature;
pub mod types;
