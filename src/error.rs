//! Startup configuration errors.
//!
//! Everything else in the crate uses per-module error enums; configuration
//! errors are the only ones that abort the process, so they live at the
//! crate root where `main` can print them and exit non-zero.

use thiserror::Error;

/// Errors raised while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("missing required setting '{key}': {hint}")]
    MissingRequired {
        /// Environment variable name.
        key: String,
        /// How to fix it.
        hint: String,
    },

    /// A setting is present but unusable.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// What went wrong.
        message: String,
    },

    /// An environment variable exists but is not valid unicode.
    #[error("environment variable '{key}' is not valid unicode")]
    NotUnicode {
        /// Environment variable name.
        key: String,
    },
}
