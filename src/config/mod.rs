//! Configuration module
//!
//! Handles daemon settings and their default locations

mod settings;

pub use settings::{
    ClientConfig, ConfigError, DaemonConfig, DeviceConfig, LinkConfig, LoggingConfig, RecoveryConfig,
};

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "hdlcd", "hdlcd")
}

/// Get the daemon configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default configuration file
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("hdlcd.toml"))
}

/// Directory for device lock files
pub fn default_lock_dir() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/var/lock")
    } else {
        std::env::temp_dir()
    }
}
