//! Mud.band Common Library
//!
//! Shared types and errors for the Mud.band client core and its front-ends.

pub mod error;
pub mod types;

pub use error::{EnrollmentPhase, Error, Result};
pub use types::*;

/// Mud.band version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default control plane endpoint
pub const DEFAULT_API_URL: &str = "https://www.mud.band/api";

/// Default state root
pub fn default_root_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mudband")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_root_path().join("mudband.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
