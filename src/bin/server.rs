use clap::Parser;
use ntsync_server::persist::ensure_store_file;
use ntsync_server::{Config, Server};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 1735)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Number of worker threads (0 = number of CPUs)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Durable store file for persistent entries
    #[arg(long, default_value = "networktables.json")]
    persist_file: String,

    /// Keep everything in memory, never touch the store file
    #[arg(long)]
    no_persist: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ntsync_server={}", log_level))
        .init();

    // Detect CPU configuration
    let num_cpus = num_cpus::get();
    let threads = if args.threads == 0 {
        num_cpus
    } else {
        args.threads
    };

    // Create configuration
    let config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        Config {
            bind_addr: args.bind,
            port: args.port,
            threads,
            persist_path: (!args.no_persist).then_some(args.persist_file),
            log_level: log_level.to_string(),
            ..Default::default()
        }
    };

    info!(
        "Starting ntsync server v{} on {}:{} with {} worker threads",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.port,
        config.threads
    );

    match &config.persist_path {
        Some(path) => {
            if ensure_store_file(Path::new(path))? {
                info!("Created empty store file {}", path);
            }
        }
        None => warn!("Persistence disabled, persistent entries will not survive a restart"),
    }

    // Create and run server
    let server = Arc::new(Server::new(config)?);

    // Setup signal handlers for graceful shutdown
    let server_clone = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, shutting down gracefully...");
        server_clone.shutdown();
    })?;

    // Run the server
    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
