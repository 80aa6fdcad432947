// ABOUTME: Library half of the superagent binary: subcommand implementations and tracing setup
// ABOUTME: Kept separate from the bin target so commands are testable

pub mod commands;
pub mod telemetry;

pub use telemetry::init_tracing;
