use clap::Parser;
use render_cache::{setup_logging, Cli, CliRunner, Config};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting render-cache v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    let cli_runner = CliRunner::new(config).await?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    let result = tokio::select! {
        result = cli_runner.run(args.command) => result,
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    cli_runner.service.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {e}");
        std::process::exit(1);
    }

    info!("render-cache stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&config_content)?
    } else {
        Config::default()
    };

    if let Some(output_dir) = &args.output_dir {
        config.output_dir = output_dir.clone();
    }

    if let Some(cache_db) = &args.cache_db {
        config.cache_db_path = cache_db.clone();
    }

    if let Some(timeout) = args.timeout {
        config.navigation_timeout = Duration::from_secs(timeout);
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    validate_config(&config)?;

    info!("Configuration loaded");
    info!("Output directory: {}", config.output_dir.display());
    info!("Cache database: {}", config.cache_db_path.display());
    info!("Navigation timeout: {:?}", config.navigation_timeout);

    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.max_pages == 0 {
        return Err("Max pages must be greater than 0".into());
    }

    if config.capture_attempts == 0 {
        return Err("Capture attempts must be greater than 0".into());
    }

    if config.navigation_timeout.as_secs() == 0 {
        return Err("Navigation timeout must be greater than 0".into());
    }

    if config.viewport.width == 0 || config.viewport.height == 0 {
        return Err("Viewport dimensions must be greater than 0".into());
    }

    if config.jpeg_quality > 100 {
        return Err("JPEG quality must be between 0 and 100".into());
    }

    if config.cache_ttl.as_secs() == 0 {
        return Err("Cache TTL must be greater than 0".into());
    }

    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to create SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
