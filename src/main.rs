use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use clippa_core::security::DEFAULT_SECRET_COST;
use clippa_party::{RetentionPolicy, TokenConfig};
use clippa_server::{ServerConfig, ShutdownCoordinator};
use clippa_store::Database;
use clippa_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Rendezvous server for clipboard-sharing parties.
#[derive(Debug, Parser)]
#[command(name = "clippa", version)]
struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// SQLite file path, optionally prefixed with `sqlite://`. `:memory:` keeps nothing.
    #[arg(long, env = "DATABASE_URL", default_value = "clippa.db")]
    database_url: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Persist warnings and errors to this SQLite file.
    #[arg(long, env = "LOG_DB")]
    log_db: Option<PathBuf>,

    /// Drop a party's hub once its last member leaves.
    #[arg(long, env = "EVICT_EMPTY_PARTIES")]
    evict_empty_parties: bool,

    /// Join tokens older than this are refused.
    #[arg(long, env = "TOKEN_TTL_SECS")]
    token_ttl_secs: Option<u64>,

    /// bcrypt cost for new party secrets.
    #[arg(
        long,
        env = "SECRET_COST",
        default_value_t = DEFAULT_SECRET_COST,
        value_parser = clap::value_parser!(u32).range(4..=31)
    )]
    secret_cost: u32,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            retention: if self.evict_empty_parties {
                RetentionPolicy::EvictWhenEmpty
            } else {
                RetentionPolicy::Retain
            },
            token: TokenConfig {
                ttl: self.token_ttl_secs.map(Duration::from_secs),
            },
            secret_cost: self.secret_cost,
            ..Default::default()
        }
    }

    fn open_database(&self) -> anyhow::Result<Database> {
        let target = self
            .database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url);
        let db = if target == ":memory:" {
            Database::in_memory()
        } else {
            Database::open(PathBuf::from(target).as_path())
        };
        db.with_context(|| format!("opening database {target}"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&cli.log_level)?,
        json: cli.log_json,
        log_db_path: cli.log_db.clone(),
        ..Default::default()
    })?;

    let db = cli.open_database()?;

    let shutdown = ShutdownCoordinator::new();
    let server = clippa_server::start(cli.server_config(), db, shutdown.token())
        .await
        .with_context(|| format!("binding {}:{}", cli.host, cli.port))?;
    tracing::info!(addr = %server.addr(), "clippa ready");

    shutdown.wait_for_signal().await;
    if !shutdown.drain(server, None).await {
        tracing::warn!("exiting with sessions still open");
    }
    tracing::info!("clippa stopped");
    Ok(())
}
