//! I/O helpers for the agent runtime.

pub mod config;
pub mod fix_store;
pub mod process;
pub mod prompt;
