//! tapline CLI - A capturing forward proxy with replay and injection scanning

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tapline::{ops, Config, JsonlStore, ProxyServer, RecordId, Replayer, Scanner};

#[derive(Parser)]
#[command(name = "tapline")]
#[command(about = "A capturing forward proxy with replay and command-injection scanning")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides config
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Capture file (overrides config)
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// List captured exchanges
    List {
        /// Capture file (overrides config)
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Print one captured exchange as JSON
    Show {
        id: RecordId,

        /// Capture file (overrides config)
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Replay a captured request and print the response body
    Repeat {
        id: RecordId,

        /// Capture file (overrides config)
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Scan a captured request for command injection
    Scan {
        id: RecordId,

        /// Capture file (overrides config)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file
    ValidateConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None => Ok(Config::parse("")?),
    }
}

fn open_store(
    cfg: &Config,
    store: Option<PathBuf>,
) -> Result<JsonlStore, Box<dyn std::error::Error>> {
    let path = store
        .or_else(|| cfg.storage.path.as_ref().map(PathBuf::from))
        .ok_or("No capture file: pass --store or set storage.path in the config")?;
    Ok(JsonlStore::open(path)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // validate-config reports load errors itself; everything else needs a config
    let mut cfg = match cli.command {
        Commands::ValidateConfig => Config::default(),
        _ => load_config(cli.config.as_ref())?,
    };

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(&cfg.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let (Some(path), false) = (&cli.config, matches!(cli.command, Commands::ValidateConfig)) {
        tracing::info!(path = %path.display(), "Loaded configuration");
    }

    match cli.command {
        Commands::Run { bind, store } => {
            // Apply CLI overrides
            if let Some(addr) = bind {
                cfg.proxy.bind_address = addr;
            }
            if let Some(path) = store {
                cfg.storage.path = Some(path.to_string_lossy().to_string());
            }

            let server = ProxyServer::new(cfg)?;

            tracing::info!("Starting proxy server...");
            tracing::info!("Configure clients with:");
            tracing::info!("  export HTTP_PROXY=http://{}", server.bind_address());
            tracing::info!("  export HTTPS_PROXY=http://{}", server.bind_address());

            // Handle Ctrl+C
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::List { store } => {
            let sink = open_store(&cfg, store)?;

            for exchange in ops::list(&sink)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    exchange.id,
                    exchange.created_at,
                    exchange.request.method,
                    exchange.response.code,
                    exchange.request.path
                );
            }
        }

        Commands::Show { id, store } => {
            let sink = open_store(&cfg, store)?;

            let exchange = ops::get(&sink, id)?;
            println!("{}", serde_json::to_string_pretty(&exchange)?);
        }

        Commands::Repeat { id, store } => {
            let sink = open_store(&cfg, store)?;
            let replayer = Replayer::new(&cfg.replay)?;

            let body = ops::repeat(&sink, &replayer, id).await?;
            println!("{}", body);
        }

        Commands::Scan { id, store, json } => {
            let sink = open_store(&cfg, store)?;
            let scanner = Scanner::new(Replayer::new(&cfg.replay)?, cfg.scanner.signatures);

            let report = ops::scan(&sink, &scanner, id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for line in report.messages() {
                    println!("{}", line);
                }
            }
        }

        Commands::ValidateConfig => validate_config(cli.config)?,
    }

    Ok(())
}

fn validate_config(path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = path.ok_or("validate-config requires --config")?;
    println!("Validating configuration: {}", path.display());

    let cfg = Config::from_file(&path)?;

    println!("Configuration is valid!");
    println!();
    println!("  Bind address: {}", cfg.proxy.bind_address);
    println!("  Connect timeout: {}s", cfg.proxy.connect_timeout_secs);
    println!("  Upstream timeout: {}s", cfg.proxy.upstream_timeout_secs);
    println!(
        "  Storage: {}",
        cfg.storage.path.as_deref().unwrap_or("memory")
    );
    println!("  Log level: {}", cfg.logging.level);
    println!("  Log requests: {}", cfg.logging.log_requests);
    println!("  Replay timeout: {}s", cfg.replay.timeout_secs);
    println!(
        "  Replay proxy: {}",
        cfg.replay.proxy.as_deref().unwrap_or("none")
    );
    println!("  Signatures: {}", cfg.scanner.signatures.len());
    for (i, sig) in cfg.scanner.signatures.iter().enumerate() {
        println!("  {}. {:?} -> {:?}", i + 1, sig.payload, sig.marker);
    }

    Ok(())
}
