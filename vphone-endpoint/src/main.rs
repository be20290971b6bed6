//! vphone-endpoint entry point.
//!
//! ```text
//! vphone-endpoint                       Run in the foreground
//! vphone-endpoint --config <path>       Load a custom config TOML
//! vphone-endpoint --gen-config          Write default config to stdout
//! vphone-endpoint --write-config <path> Write default config to a file
//! vphone-endpoint --ring-in-after <ms>  Simulate an incoming call
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vphone_endpoint::config::EndpointConfig;
use vphone_endpoint::service::{EndpointService, ExitReason};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vphone-endpoint", about = "Videophone endpoint with VRCL remote control")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vphone-endpoint.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to this path and exit.
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,

    /// Override the VRCL listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Present a simulated incoming call this many milliseconds after start.
    #[arg(long, value_name = "MS")]
    ring_in_after: Option<u64>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&EndpointConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if let Some(path) = &cli.write_config {
        EndpointConfig::write_default(path)?;
        println!("Default configuration written to {}.", path.display());
        return Ok(());
    }

    let mut config = EndpointConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.vrcl.port = port;
    }
    if let Some(ms) = cli.ring_in_after {
        config.loopback.ring_in_after_ms = ms;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vphone-endpoint v{}", env!("CARGO_PKG_VERSION"));
    info!("local name: {}", config.conference.local_name);
    info!("max calls: {}", config.conference.max_calls);

    let mut service = match EndpointService::start(config) {
        Ok(service) => service,
        Err(e) => {
            error!("failed to start: {e}");
            return Err(e.into());
        }
    };

    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.notify_one();
    });

    let exit = service.run().await;
    service.shutdown();

    if let ExitReason::Restart(reason) = exit {
        std::process::exit(reason.code() as i32);
    }
    Ok(())
}
