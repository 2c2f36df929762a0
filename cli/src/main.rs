//! chainstream: stream account transaction history to WebSocket clients.
//!
//! Usage:
//! ```bash
//! DATABASE_URL=postgresql://memento@localhost/memento chainstream serve --port 12345
//! chainstream --log-json serve --database mysql --database-url mysql://memento@localhost/memento
//! chainstream info
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use chainstream_core::{QueryExecutor, StreamConfig};
use chainstream_storage::{MySqlExecutor, PgExecutor, PostgresOptions, SqliteExecutor};
use chainstream_ws::WsServer;

mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "chainstream",
    about = "Adaptive transaction-history streaming over WebSocket",
    version
)]
struct Cli {
    /// Global log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Per-crate level override, repeatable: `--log chainstream_core=debug`
    #[arg(long = "log", value_name = "CRATE=LEVEL", global = true)]
    log_overrides: Vec<String>,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket server
    Serve(ServeArgs),
    /// Print the effective configuration and exit
    Info(ServeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Postgres,
    Mysql,
    Sqlite,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "SERVER_BIND_IP", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    #[arg(long, env = "SERVER_BIND_PORT", default_value_t = 12345)]
    port: u16,

    /// History store backend
    #[arg(long, env = "DATABASE_SELECT", value_enum, default_value_t = Backend::Postgres)]
    database: Backend,

    /// Connection URL (or file path for sqlite)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum pooled database connections
    #[arg(long, env = "CONNECTION_POOL", default_value_t = 10)]
    pool_size: u32,

    #[command(flatten)]
    stream: StreamArgs,
}

#[derive(Args, Debug)]
struct StreamArgs {
    /// Blocks probed for match density before each trace query
    #[arg(long, env = "WS_TRACE_TRANSACTIONS_BLOCKS_THRESHOLD", default_value_t = 100)]
    probe_window_blocks: u64,

    /// Target matches per trace query
    #[arg(long, env = "WS_TRACE_TRANSACTIONS_LIMIT", default_value_t = 100)]
    match_target: u64,

    /// Fork records fetched per scan cycle
    #[arg(long, env = "WS_FORK_TRANSACTIONS_LIMIT", default_value_t = 100)]
    fork_page_size: u64,

    #[arg(long, env = "WS_TICK_INTERVAL_MS", default_value_t = 1000)]
    tick_interval_ms: u64,

    #[arg(long, env = "WS_FORK_SCAN_INTERVAL_MS", default_value_t = 500)]
    fork_scan_interval_ms: u64,

    #[arg(long, env = "WS_INVALID_ARGS_GRACE_MS", default_value_t = 1000)]
    invalid_args_grace_ms: u64,
}

impl StreamArgs {
    fn to_config(&self) -> StreamConfig {
        StreamConfig {
            probe_window_blocks: self.probe_window_blocks,
            match_target: self.match_target,
            fork_page_size: self.fork_page_size,
            tick_interval_ms: self.tick_interval_ms,
            fork_scan_interval_ms: self.fork_scan_interval_ms,
            invalid_args_grace_ms: self.invalid_args_grace_ms,
        }
    }
}

/// An open history store, kept so the pool can be closed on shutdown.
enum Store {
    Postgres(PgExecutor),
    MySql(MySqlExecutor),
    Sqlite(SqliteExecutor),
}

impl Store {
    async fn open(backend: Backend, url: &str, pool_size: u32) -> Result<Self> {
        Ok(match backend {
            Backend::Postgres => {
                let opts = PostgresOptions { max_connections: pool_size, ..Default::default() };
                Self::Postgres(PgExecutor::connect_with_options(url, opts).await?)
            }
            Backend::Mysql => Self::MySql(MySqlExecutor::connect(url, pool_size).await?),
            Backend::Sqlite => Self::Sqlite(SqliteExecutor::open(url).await?),
        })
    }

    fn executor(&self) -> Arc<dyn QueryExecutor> {
        match self {
            Self::Postgres(e) => Arc::new(e.clone()),
            Self::MySql(e) => Arc::new(e.clone()),
            Self::Sqlite(e) => Arc::new(e.clone()),
        }
    }

    async fn close(&self) {
        match self {
            Self::Postgres(e) => e.close().await,
            Self::MySql(e) => e.close().await,
            Self::Sqlite(e) => e.close().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = LogConfig { level: cli.log_level.clone(), json: cli.log_json, ..Default::default() }
        .with_overrides(cli.log_overrides.iter().map(String::as_str));
    init_tracing(&log);

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Info(args) => cmd_info(&args, &log),
    }
}

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let config = args.stream.to_config();
    config.validate().context("invalid stream configuration")?;
    let url = args.database_url.as_deref().context("DATABASE_URL (or --database-url) is required")?;

    let store = Store::open(args.database, url, args.pool_size)
        .await
        .with_context(|| format!("cannot open {:?} history store", args.database))?;
    info!(backend = ?args.database, pool_size = args.pool_size, "history store connected");

    let server = WsServer::new(config, store.executor()).context("cannot start engine")?;
    let outbound = Arc::clone(server.outbound());
    let addr = SocketAddr::new(args.bind_ip, args.port);
    let listener = WsServer::bind(addr).await?;

    server
        .serve(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
            }
        })
        .await;

    // Let connection tasks flush their close frames.
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while outbound.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        info!(open = outbound.connection_count(), "shutdown drain timed out");
    }

    store.close().await;
    info!("stopped");
    Ok(())
}

fn cmd_info(args: &ServeArgs, log: &LogConfig) -> Result<()> {
    println!("ChainStream v{}", env!("CARGO_PKG_VERSION"));
    println!("  Listen:   {}", SocketAddr::new(args.bind_ip, args.port));
    println!("  Backend:  {:?} (pool {})", args.database, args.pool_size);
    println!(
        "  Database: {}",
        if args.database_url.is_some() { "configured" } else { "not set" }
    );
    println!("  Logging:  {}{}", log.directives(), if log.json { " (json)" } else { "" });
    println!("  Stream:");
    println!("{}", serde_json::to_string_pretty(&args.stream.to_config())?);
    Ok(())
}
