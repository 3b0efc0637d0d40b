use thiserror::Error;

/// Errors related to application configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable required by the application is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A setting was expected to hold a boolean but could not be parsed as one.
    #[error("Invalid boolean for {key}: {value:?}")]
    InvalidBool {
        /// Name of the offending setting.
        key: String,
        /// The raw value that failed to parse.
        value: String,
    },
}

/// Parses a boolean setting the way configuration files usually spell them.
///
/// Accepts `true`/`false`, `yes`/`no`, `on`/`off` and `1`/`0`, ignoring case
/// and surrounding whitespace.
///
/// # Arguments
/// * `key` - The setting name, used only for the error message.
/// * `value` - The raw string value.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
