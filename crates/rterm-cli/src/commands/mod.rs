//! CLI subcommand implementations.

pub mod connect;
pub mod exec;

/// Farewell the server sends in response to `exit` or `quit`.
pub const GOODBYE_MESSAGE: &str = "Goodbye!";
