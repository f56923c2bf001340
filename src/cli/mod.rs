//! Command-line surface

pub mod args;
pub mod commands;
pub mod operation;

pub use args::{Cli, Commands, OutputFormat};
pub use operation::Operation;
