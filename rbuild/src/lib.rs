//! Remote build bridge: keep a server mirror of a git project in lockstep
//! with the client and run builds there.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (reconcile decisions, path
//!   sanitizing, change classification). No I/O.
//! - **[`io`]**: Side-effecting operations (git, processes, filesystem,
//!   HTTP client, build jobs).
//!
//! Orchestration modules ([`reconcile`], [`sync`]) combine the two. The
//! server crate (`rbuild-server`) exposes [`io::jobs`] and the git adapter
//! over HTTP; the `rbuild` binary drives [`sync`] against it.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod reconcile;
pub mod sync;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
