//! Subcommand implementations.

pub mod engine;
pub mod generate;
