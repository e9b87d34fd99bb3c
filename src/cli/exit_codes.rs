//! CLI Exit Codes
//!
//! Distinct exit statuses so that service managers and scripts can tell
//! startup failures apart.

use crate::config::ConfigError;
use crate::core::serial::handler::LinkError;
use std::process::ExitCode;
use thiserror::Error;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 3;

    /// Device lock held by another process
    pub const LOCK_HELD: u8 = 4;

    /// Serial device could not be opened
    pub const DEVICE_OPEN_FAILED: u8 = 5;

    /// Listening socket could not be bound
    pub const BIND_FAILED: u8 = 6;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// Daemon startup failures
#[derive(Error, Debug)]
pub enum StartupError {
    /// Bad or unreadable configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A device could not be locked or opened
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Listening socket could not be bound
    #[error("Cannot listen on {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Cause
        source: std::io::Error,
    },
}

impl StartupError {
    /// Exit status for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => ExitCodes::CONFIG_ERROR,
            Self::Link(LinkError::Lock(_)) => ExitCodes::LOCK_HELD,
            Self::Link(LinkError::Open { .. }) => ExitCodes::DEVICE_OPEN_FAILED,
            Self::Link(LinkError::DuplicateDevice(_)) => ExitCodes::CONFIG_ERROR,
            Self::Link(_) => ExitCodes::ERROR,
            Self::Bind { .. } => ExitCodes::BIND_FAILED,
        }
    }
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Failure with `code`
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<StartupError> for CliResult {
    fn from(err: StartupError) -> Self {
        Self::Error(err.exit_code(), err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        ExitCodes::SUCCESS => "Success",
        ExitCodes::ERROR => "General error",
        ExitCodes::INVALID_ARGS => "Invalid arguments",
        ExitCodes::CONFIG_ERROR => "Configuration error",
        ExitCodes::LOCK_HELD => "Serial device locked by another process",
        ExitCodes::DEVICE_OPEN_FAILED => "Serial device could not be opened",
        ExitCodes::BIND_FAILED => "Listen address could not be bound",
        ExitCodes::INTERNAL_ERROR => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 5, 6, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
