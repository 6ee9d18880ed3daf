use anyhow::Context;
use clap::Parser;
use post_rs::config::{Config, LoggingConfig};
use post_rs::smtp::{DefaultHandler, SmtpServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "post-rs")]
#[command(about = "SMTP/LMTP protocol engine", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 127.0.0.1:2525)
    #[arg(short, long)]
    listen: Option<String>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        Config::default()
    };
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    init_logging(&config.logging);
    if !cli.config.exists() {
        info!("No config file found at {}, using defaults", cli.config.display());
    }

    info!("Starting post-rs");
    info!("  Listening on: {}", config.server.listen_addr);
    info!("  Protocol: {}", if config.server.lmtp { "LMTP" } else { "SMTP" });
    info!("  Server name: {}", config.server_name());

    let server = Arc::new(SmtpServer::new(config, Arc::new(DefaultHandler))?);

    let runner = Arc::clone(&server);
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut handle => {
            match result {
                Ok(Ok(())) => info!("Server exited"),
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task panic: {}", e),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    server.close().await;
    let _ = handle.await;

    Ok(())
}
