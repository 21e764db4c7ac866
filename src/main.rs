//! nosqlgate CLI - MongoDB wire-protocol gateway

use clap::{Parser, Subcommand};
use nosqlgate::codec::json;
use nosqlgate::query::translate_filter;
use nosqlgate::{Config, Gateway};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "nosqlgate")]
#[command(about = "A MongoDB wire-protocol gateway backed by SQL", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the configuration file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// SQLite database file (overrides the configuration file)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept MongoDB clients
    Serve,

    /// Print the SQL predicate for a filter given as JSON
    Translate {
        /// The filter, e.g. '{"field": {"$gte": 3}}'
        filter: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Translate { filter } => translate(&config, &filter),
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(addr) = cli.bind {
        config.listen = addr;
    }
    if let Some(path) = &cli.database {
        config.database_path = Some(path.clone());
    }
    Ok(config)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    match &config.database_path {
        Some(path) => info!(path = %path.display(), "opening database"),
        None => info!("no database path configured, data lives in memory"),
    }

    let gateway = Gateway::open(config)?;
    let server = gateway.bind().await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}

fn translate(config: &Config, filter: &str) -> anyhow::Result<()> {
    let filter = json::decode(filter, &config.codec_limits())?;
    let predicate = translate_filter(&filter, &config.table)?;

    println!("{}", predicate.sql);
    for (i, param) in predicate.params.iter().enumerate() {
        println!("  ?{} = {:?}", i + 1, param);
    }
    Ok(())
}
