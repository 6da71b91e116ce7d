//! SecureChat CLI library
//!
//! Command-line definitions, terminal input parsing and command handlers for
//! the `securechat` binary.

pub mod cli;
pub mod commands;
pub mod error;
pub mod input;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use error::{CliError, Result};
