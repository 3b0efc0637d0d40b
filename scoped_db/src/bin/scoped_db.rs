use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diesel::{PgConnection, SqliteConnection};
use scoped_db::{
    Backend, DatabaseConfig, Dialect, Engine, ObjectKind,
    config::load_config_path,
    destroy_url,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Scoped database maintenance CLI")]
struct Cli {
    /// TOML config file; falls back to DATABASE_URL / DATABASE_DESTROYABLE.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Open the pool and report its state.
    Check,
    /// Drop every table, view, sequence, enum type and trigger.
    Destroy,
}

fn load(cli: &Cli) -> Result<DatabaseConfig> {
    match &cli.config {
        Some(path) => load_config_path(path),
        None => DatabaseConfig::from_env().context("no --config given and environment is incomplete"),
    }
}

fn check<C: Backend>(cfg: &DatabaseConfig) -> Result<()> {
    let engine = Engine::<C>::from_config(cfg)?;
    let conn = engine.checkout()?;
    println!(
        "{}: pool {}/{} in use, {} idle",
        engine.dialect(),
        engine.checked_out(),
        engine.max_size(),
        engine.idle()
    );
    drop(conn);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli)?;

    match cli.cmd {
        Cmd::Check => match Dialect::from_url(&cfg.url)? {
            Dialect::Postgres => check::<PgConnection>(&cfg)?,
            Dialect::Sqlite => check::<SqliteConnection>(&cfg)?,
        },
        Cmd::Destroy => {
            let report = destroy_url(&cfg.url, cfg.destroyable)?;
            for kind in [
                ObjectKind::Sequence,
                ObjectKind::View,
                ObjectKind::EnumType,
                ObjectKind::Trigger,
                ObjectKind::Table,
            ] {
                let n = report.count(kind);
                if n > 0 {
                    println!("dropped {n} {kind}(s)");
                }
            }
            if report.is_empty() {
                println!("nothing to drop");
            }
        }
    }

    Ok(())
}
