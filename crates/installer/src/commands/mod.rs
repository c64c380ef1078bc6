//! CLI subcommands.

pub mod install;
