//! Typed env-var parsing helpers shared by the config sections.

use crate::error::ConfigError;

/// Read an env var, treating unset and empty as `None`.
pub(crate) fn optional_env(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: "not valid unicode".to_string(),
        }),
    }
}

/// Read a string env var with a default.
pub(crate) fn parse_string_env(
    name: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(name)?.unwrap_or_else(|| default.into()))
}

/// Read a boolean env var ("true"/"false"/"1"/"0", case-insensitive).
pub(crate) fn parse_bool_env(name: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(name)? {
        None => Ok(default),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                reason: format!("expected boolean, got '{}'", other),
            }),
        },
    }
}

/// Read a numeric env var with a default.
pub(crate) fn parse_optional_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(name)? {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e| ConfigError::InvalidValue {
            name: name.to_string(),
            reason: format!("{}", e),
        }),
    }
}

/// Read a comma-separated list env var; unset yields the default.
pub(crate) fn parse_list_env(name: &str, default: Vec<String>) -> Result<Vec<String>, ConfigError> {
    Ok(optional_env(name)?
        .map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or(default))
}
