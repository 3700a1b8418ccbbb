//! Human-in-the-loop orchestrator that turns agent conversation history into
//! reviewable changes to agent instructions and skill files.
//!
//! - **[`core`]**: Pure, deterministic logic (ids, job and proposal state
//!   machines, diff parsing, validation, in-memory patching). No I/O.
//! - **[`io`]**: Side effects (processes, artifact files, config, session
//!   history, prompt rendering).
//!
//! Orchestration modules ([`insights`], [`proposals`], [`apply`]) hang off the
//! [`orchestrator::Orchestrator`] facade, which the CLI and the HTTP server
//! share.

pub mod apply;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod insights;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod proposals;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
