//! Autonomous task execution: a planner that delegates to sub-agents.
//!
//! A task enters through [`intake`], is owned by the [`planner`] loop, and is
//! carried out through capabilities run by the [`tools`] dispatcher, either
//! directly or inside a bounded sub-agent ([`agents`]). Failures feed the
//! [`fix_registry`] so known fixes resurface on the next occurrence, and
//! every step is published on the [`events`] sink.
//!
//! - **[`core`]**: Pure, deterministic logic (budgets, loop detection,
//!   compaction, error signatures, routing). No I/O.
//! - **[`io`]**: Side-effecting helpers (config, fix log, child processes,
//!   prompt rendering).
//!
//! [`runtime`] assembles the long-lived collaborators from configuration.

pub mod agents;
pub mod cancel;
pub mod core;
pub mod events;
pub mod exit_codes;
pub mod fix_registry;
pub mod intake;
pub mod io;
pub mod llm;
pub mod logging;
pub mod planner;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
