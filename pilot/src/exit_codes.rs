//! Stable exit codes for pilot CLI commands.

/// Command succeeded; for `pilot run`, the task completed.
pub const OK: i32 = 0;
/// Command failed due to invalid config, arguments or other errors.
pub const INVALID: i32 = 1;
/// `pilot run` ended without completing the task (gave up, stopped, limits).
pub const INCOMPLETE: i32 = 2;
