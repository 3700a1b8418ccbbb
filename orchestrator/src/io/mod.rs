//! I/O helpers: processes, filesystem, configuration and agent history.

pub mod artifact_store;
pub mod atomic;
pub mod config;
pub mod init;
pub mod invoker;
pub mod job_runner;
pub mod process;
pub mod prompt;
pub mod sessions;
