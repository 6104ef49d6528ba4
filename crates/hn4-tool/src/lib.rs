#![warn(missing_docs)]

//! HN4 tool: trajectory inspection and a self-contained volume exercise.

/// Command-line interface.
pub mod cli;
/// End-to-end volume scenario.
pub mod exercise;

pub use cli::{Cli, Command};
pub use exercise::{run_scenario, ExerciseReport};
