use crate::config::{ConfigError, parse_bool};

/// Reads an environment variable, returning a structured error if it's missing.
///
/// This is a thin wrapper around `std::env::var` that provides a more
/// ergonomic and specific error type for missing variables.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

/// Reads an optional boolean flag from the environment.
///
/// Returns `Ok(None)` when the variable is unset, and an error when it is set
/// to something [`parse_bool`] does not understand.
pub fn get_env_flag(name: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_bool(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}
