//! Subcommand implementations.

pub mod agent;
pub mod ssh;
pub mod up;
