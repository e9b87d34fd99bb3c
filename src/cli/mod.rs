//! CLI Module
//!
//! Provides command-line support shared by the binaries:
//! - Exit codes for service managers and scripts

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes, StartupError};
