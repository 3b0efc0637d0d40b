//! Database configuration: parsing, defaults, and loading.
//!
//! A [`DatabaseConfig`] can be built three ways:
//! - from a TOML document: [`load_config_str`] / [`load_config_path`]
//! - from flat dotted key/value settings: [`DatabaseConfig::from_settings`]
//! - from the environment: [`DatabaseConfig::from_env`]
//!
//! Example TOML:
//! ```toml
//! url = "postgresql://app@localhost/app"
//! pool_size = 10
//! pool_recycle = 3600
//! destroyable = false
//!
//! [ctx]
//! member = "db"
//! transaction = true
//! ```
//!
//! `destroyable` defaults to `false` everywhere. It must be switched on
//! explicitly before any schema-dropping operation is allowed.

use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use shared_utils::{get_env_flag, get_env_var, parse_bool};

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: u32 = 5;
/// Default checkout timeout in seconds.
pub const DEFAULT_POOL_TIMEOUT: f64 = 30.0;
/// Default name of the context member providing the connection.
pub const DEFAULT_CTX_MEMBER: &str = "db";

/// Connection, pool, and lifecycle settings for one database.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection URL (`postgresql://...`, `sqlite://...` or a SQLite file path).
    pub url: String,
    /// Log every executed statement.
    #[serde(default)]
    pub echo: bool,
    /// Log pool connection opens and closes.
    #[serde(default)]
    pub echo_pool: bool,
    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Recycle pooled connections older than this many seconds.
    #[serde(default)]
    pub pool_recycle: Option<u64>,
    /// Seconds to wait for a free connection before giving up.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: f64,
    /// Whether destructive operations may be performed on the database.
    #[serde(default)]
    pub destroyable: bool,
    /// Per-context connection settings.
    #[serde(default)]
    pub ctx: ContextConfig,
}

/// Settings for the context-scoped connection member.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    /// Name of the context member; `None` disables per-context connections.
    #[serde(default = "default_ctx_member", deserialize_with = "member_name")]
    pub member: Option<String>,
    /// Wrap each context's connection in a transaction.
    #[serde(default = "default_true")]
    pub transaction: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            member: default_ctx_member(),
            transaction: true,
        }
    }
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_pool_timeout() -> f64 {
    DEFAULT_POOL_TIMEOUT
}

fn default_ctx_member() -> Option<String> {
    Some(DEFAULT_CTX_MEMBER.to_string())
}

fn default_true() -> bool {
    true
}

// "None" (and the empty string) switch the member off.
fn normalize_member(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "None" {
        None
    } else {
        Some(raw.to_string())
    }
}

fn member_name<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.as_deref().and_then(normalize_member))
}

impl DatabaseConfig {
    /// A config for `url` with every other setting at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            echo: false,
            echo_pool: false,
            pool_size: DEFAULT_POOL_SIZE,
            pool_recycle: None,
            pool_timeout: DEFAULT_POOL_TIMEOUT,
            destroyable: false,
            ctx: ContextConfig::default(),
        }
    }

    /// Checkout timeout as a [`Duration`].
    ///
    /// Out-of-range values saturate; [`DatabaseConfig::validate`] rejects them.
    pub fn checkout_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.pool_timeout).unwrap_or(Duration::MAX)
    }

    /// Connection max lifetime derived from `pool_recycle`.
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.pool_recycle.map(Duration::from_secs)
    }

    /// Rejects values the pool cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.trim().is_empty() {
            bail!("url must not be empty");
        }
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if !(self.pool_timeout.is_finite() && self.pool_timeout > 0.0) {
            bail!("pool_timeout must be a positive number of seconds");
        }
        if Duration::try_from_secs_f64(self.pool_timeout).is_err() {
            bail!("pool_timeout is too large: {}", self.pool_timeout);
        }
        if self.pool_recycle == Some(0) {
            bail!("pool_recycle must be positive when set");
        }
        Ok(())
    }

    /// Builds a config from flat dotted settings.
    ///
    /// Recognized keys: `engine.url`, `engine.echo`, `engine.echo_pool`,
    /// `engine.pool_size`, `engine.pool_recycle`, `engine.pool_timeout`,
    /// `destroyable`, `ctx.member`, `ctx.transaction`. Booleans accept the
    /// spellings understood by [`parse_bool`]. A negative `engine.pool_recycle`
    /// disables recycling. Unknown keys are an error.
    pub fn from_settings<I, K, V>(settings: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = Self::new(String::new());
        let mut saw_url = false;

        for (key, value) in settings {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "engine.url" => {
                    cfg.url = value.trim().to_string();
                    saw_url = true;
                }
                "engine.echo" => cfg.echo = parse_bool(key, value)?,
                "engine.echo_pool" => cfg.echo_pool = parse_bool(key, value)?,
                "engine.pool_size" => {
                    cfg.pool_size = value
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be an integer, got {value:?}"))?;
                }
                "engine.pool_recycle" => {
                    let secs: i64 = value
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be an integer, got {value:?}"))?;
                    cfg.pool_recycle = u64::try_from(secs).ok().filter(|s| *s > 0);
                }
                "engine.pool_timeout" => {
                    cfg.pool_timeout = value
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a number, got {value:?}"))?;
                }
                "destroyable" => cfg.destroyable = parse_bool(key, value)?,
                "ctx.member" => cfg.ctx.member = normalize_member(value),
                "ctx.transaction" => cfg.ctx.transaction = parse_bool(key, value)?,
                other => bail!("unknown database setting: {other}"),
            }
        }

        if !saw_url {
            bail!("missing required setting engine.url");
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Builds a config from `DATABASE_URL` and the optional `DATABASE_DESTROYABLE` flag.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::new(get_env_var("DATABASE_URL")?);
        if let Some(destroyable) = get_env_flag("DATABASE_DESTROYABLE")? {
            cfg.destroyable = destroyable;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Parse and validate a config from a TOML string.
pub fn load_config_str(toml_str: &str) -> anyhow::Result<DatabaseConfig> {
    let cfg: DatabaseConfig = toml::from_str(toml_str).context("failed to parse database TOML")?;
    cfg.validate().context("invalid database configuration")?;
    Ok(cfg)
}

/// Read a TOML file from disk, parse, and validate it.
///
/// See [`load_config_str`] for details.
pub fn load_config_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<DatabaseConfig> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read config file {}", path.as_ref().display()))?;
    load_config_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serial_test::serial;

    #[test]
    fn toml_defaults_are_safe() {
        let cfg = load_config_str(r#"url = "postgresql://app@localhost/app""#).unwrap();
        assert!(!cfg.destroyable);
        assert!(cfg.ctx.transaction);
        assert_eq!(cfg.ctx.member.as_deref(), Some("db"));
        assert_eq!(cfg.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(cfg.max_lifetime(), None);
        assert_eq!(cfg.checkout_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn toml_full_document() {
        let cfg = load_config_str(
            r#"
            url = "sqlite:///tmp/app.db"
            echo = true
            pool_size = 2
            pool_recycle = 600
            pool_timeout = 0.5
            destroyable = true
            [ctx]
            member = "None"
            transaction = false
            "#,
        )
        .unwrap();
        assert!(cfg.echo);
        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.max_lifetime(), Some(Duration::from_secs(600)));
        assert_eq!(cfg.checkout_timeout(), Duration::from_millis(500));
        assert!(cfg.destroyable);
        assert_eq!(cfg.ctx.member, None);
        assert!(!cfg.ctx.transaction);
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let err = load_config_str("url = \"x.db\"\npoolsize = 3").unwrap_err();
        assert!(format!("{err:#}").contains("poolsize"));
    }

    #[test]
    fn toml_rejects_zero_pool() {
        let err = load_config_str("url = \"x.db\"\npool_size = 0").unwrap_err();
        assert!(format!("{err:#}").contains("pool_size"));
    }

    #[test]
    fn toml_rejects_unrepresentable_pool_timeout() {
        let err = load_config_str("url = \"x.db\"\npool_timeout = 1e30").unwrap_err();
        assert!(format!("{err:#}").contains("pool_timeout"));

        let mut cfg = DatabaseConfig::new("x.db");
        cfg.pool_timeout = 1e30;
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.checkout_timeout(), Duration::MAX);
    }

    #[test]
    fn flat_settings_are_parsed() {
        let mut settings: IndexMap<&str, &str> = IndexMap::new();
        settings.insert("engine.url", "postgresql://localhost/app");
        settings.insert("engine.echo", "yes");
        settings.insert("engine.pool_size", "12");
        settings.insert("engine.pool_recycle", "-1");
        settings.insert("destroyable", "on");
        settings.insert("ctx.member", "conn");
        settings.insert("ctx.transaction", "0");

        let cfg = DatabaseConfig::from_settings(settings).unwrap();
        assert_eq!(cfg.url, "postgresql://localhost/app");
        assert!(cfg.echo);
        assert_eq!(cfg.pool_size, 12);
        assert_eq!(cfg.pool_recycle, None);
        assert!(cfg.destroyable);
        assert_eq!(cfg.ctx.member.as_deref(), Some("conn"));
        assert!(!cfg.ctx.transaction);
    }

    #[test]
    fn flat_settings_require_url_and_reject_unknown() {
        let err = DatabaseConfig::from_settings([("destroyable", "true")]).unwrap_err();
        assert!(err.to_string().contains("engine.url"));

        let err =
            DatabaseConfig::from_settings([("engine.url", "x.db"), ("engine.bogus", "1")]).unwrap_err();
        assert!(err.to_string().contains("engine.bogus"));
    }

    #[test]
    fn flat_settings_report_bad_booleans() {
        let err =
            DatabaseConfig::from_settings([("engine.url", "x.db"), ("destroyable", "sure")]).unwrap_err();
        assert!(err.to_string().contains("destroyable"));
    }

    #[test]
    #[serial]
    fn env_config_reads_url_and_flag() {
        unsafe {
            std::env::set_var("DATABASE_URL", "/tmp/env.db");
            std::env::set_var("DATABASE_DESTROYABLE", "true");
        }
        let cfg = DatabaseConfig::from_env().unwrap();
        assert_eq!(cfg.url, "/tmp/env.db");
        assert!(cfg.destroyable);

        unsafe { std::env::remove_var("DATABASE_DESTROYABLE") };
        assert!(!DatabaseConfig::from_env().unwrap().destroyable);

        unsafe { std::env::remove_var("DATABASE_URL") };
        assert!(DatabaseConfig::from_env().is_err());
    }
}
