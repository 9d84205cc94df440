//! I/O layer: git, processes, filesystem, HTTP client and build jobs.

pub mod client;
pub mod config;
pub mod git;
pub mod jobs;
pub mod live;
pub mod process;
pub mod runtime;
pub mod transfer;
