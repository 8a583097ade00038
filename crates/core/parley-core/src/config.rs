//! Environment loading and typed accessors
//!
//! Configuration is read once at startup. Every accessor here is a plain
//! function over the process environment; the adaptor and provider crates
//! build their own config structs on top of them.

use crate::{ParleyError, Result};
use std::env;
use std::path::PathBuf;

/// Load environment variables from a `.env` file
///
/// A missing file is not an error; the system environment is used as-is and
/// `None` is returned. Runs before logging is installed so `.env` can set
/// `RUST_LOG`; callers log the outcome.
pub fn load_env() -> Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(dotenvy::Error::LineParse(line, pos)) => Err(ParleyError::config(format!(
            "Failed to parse .env file at line {}, position {}",
            line, pos
        ))),
        Err(dotenvy::Error::Io(_)) => Ok(None),
        Err(e) => Err(ParleyError::config(format!(
            "Failed to load .env file: {}",
            e
        ))),
    }
}

/// Get required environment variable
///
/// Returns an error if the variable is not set or is blank
pub fn get_required_env(key: &str) -> Result<String> {
    get_optional_env(key).ok_or_else(|| {
        ParleyError::config(format!(
            "Required environment variable '{}' is not set. \
             Check your .env file or system environment.",
            key
        ))
    })
}

/// Get environment variable, treating blank values as unset
pub fn get_optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Get optional environment variable with default
pub fn get_env_or(key: &str, default: &str) -> String {
    get_optional_env(key).unwrap_or_else(|| default.to_string())
}

/// Get environment variable as boolean
pub fn get_env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

/// Get environment variable as integer
pub fn get_env_int<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Get an optional platform snowflake id
///
/// Unset means `None`; a value that is set but not a positive integer is a
/// configuration error rather than silently ignored.
pub fn get_env_id(key: &str) -> Result<Option<u64>> {
    match get_optional_env(key) {
        None => Ok(None),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) | Err(_) => Err(ParleyError::config(format!(
                "Environment variable '{}' must be a numeric id, got '{}'",
                key, raw
            ))),
            Ok(id) => Ok(Some(id)),
        },
    }
}
