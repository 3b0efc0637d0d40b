//! Small helpers shared across the workspace: environment lookups and
//! string-valued setting parsers.

pub mod config;
pub mod env;

pub use config::{ConfigError, parse_bool};
pub use env::{get_env_flag, get_env_var};
