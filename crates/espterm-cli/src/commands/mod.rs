//! CLI subcommand implementations.

pub mod monitor;
pub mod send;
