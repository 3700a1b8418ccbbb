//! Stable exit codes for `codex-orchestrator` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, missing record, bad config or any other error.
pub const INVALID: i32 = 1;
/// A proposal (or diff) was blocked by validation or did not apply cleanly.
pub const BLOCKED: i32 = 2;
/// The agent job failed, was canceled, or produced unusable output.
pub const JOB_FAILED: i32 = 3;
