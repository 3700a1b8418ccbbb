//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! (ids, job and proposal state machines, diffs, validation policy) and return
//! deterministic outputs suitable for tests.

pub mod diff;
pub mod ids;
pub mod insight;
pub mod job;
pub mod output;
pub mod patch;
pub mod proposal;
pub mod run;
pub mod tail;
pub mod validator;
