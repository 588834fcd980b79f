//! Environment lookup helpers shared by the config sections.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an optional environment variable.
///
/// Returns `None` when unset, `Err` when set but not valid unicode.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(ConfigError::NotUnicode { key: key.to_string() })
        }
    }
}

/// Read an optional environment variable and parse it, falling back to a
/// default when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Read a boolean flag: `1`, `true`, `TRUE`, and `yes` are truthy,
/// anything else (including unset) is false.
pub(crate) fn env_flag(key: &str) -> Result<bool, ConfigError> {
    Ok(matches!(
        optional_env(key)?.as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    ))
}
