//! Stable exit codes for `rbuild` commands.

/// Command succeeded (sides in sync, build passed, pull complete).
pub const OK: i32 = 0;
/// Operational failure: bad config, unreachable server, reconcile `ERROR`.
pub const ERROR: i32 = 1;
/// The build ran but did not finish with exit code 0.
pub const BUILD_FAILED: i32 = 2;
/// Reconciliation was blocked by policy (dirty tree, diverged history, ...).
pub const BLOCKED: i32 = 3;
