//! Subcommand implementations.

pub mod bus;
pub mod relay;
