//! Subcommand implementations.

pub mod inspect;
pub mod schedule;
pub mod train;
