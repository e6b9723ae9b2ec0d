use crate::{Config, HousekeepingScheduler, RenderOutcome, RenderRequest, RenderService};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "render-cache")]
#[command(about = "Render web pages to cached JPEG captures")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Directory for capture output files")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help = "SQLite cache database path")]
    pub cache_db: Option<PathBuf>,

    #[arg(long, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render a URL to a capture file, honoring the cache
    Render {
        #[arg(short, long, help = "URL to render")]
        url: String,

        #[arg(short, long, help = "Cache key for this render")]
        key: String,

        #[arg(long, help = "Ignore any cached entry and re-render")]
        force: bool,
    },

    /// Inspect or modify the cache store
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Run one housekeeping pass now
    Cleanup,

    /// Show engine and cache health
    Health,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List all cache entries, newest first
    List,

    /// Delete one cache entry by key
    Delete {
        #[arg(short, long, help = "Cache key to delete")]
        key: String,
    },

    /// Delete every cache entry
    Clear,
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<RenderService>,
}

impl CliRunner {
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let service = Arc::new(RenderService::new(config.clone()).await?);
        Ok(Self { config, service })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Render { url, key, force } => self.run_render(url, key, force).await,
            Commands::Cache { command } => self.run_cache(command).await,
            Commands::Cleanup => self.run_cleanup().await,
            Commands::Health => self.show_health().await,
        }
    }

    pub async fn run_render(
        &self,
        url: String,
        key: String,
        force: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        info!("rendering {url} under key {key}");

        let mut request = RenderRequest::new(url, key);
        if force {
            request = request.force_refresh();
        }

        match self.service.get_render(&request).await? {
            RenderOutcome::Cached(remote_ref) => {
                println!("Served from cache:");
                println!("  Locator id: {}", remote_ref.locator_id);
                println!("  Entry id:   {}", remote_ref.entry_id);
            }
            RenderOutcome::Captured(path) => {
                println!("Captured fresh render:");
                println!("  File: {}", path.display());
            }
        }

        Ok(())
    }

    pub async fn run_cache(&self, command: CacheCommands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            CacheCommands::List => {
                let entries = self.service.list_cache()?;
                if entries.is_empty() {
                    println!("Cache is empty");
                    return Ok(());
                }

                let ttl = self.config.cache_ttl;
                println!("{} cache entries:", entries.len());
                for entry in entries {
                    let state = if entry.is_expired(ttl) { "expired" } else { "fresh" };
                    println!(
                        "  {} -> locator {} / entry {} ({}, created {})",
                        entry.cache_key,
                        entry.remote_locator_id,
                        entry.remote_entry_id,
                        state,
                        entry.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    );
                }
            }
            CacheCommands::Delete { key } => {
                if self.service.delete_cache_entry(&key)? {
                    println!("Deleted cache entry for {key}");
                } else {
                    println!("No cache entry for {key}");
                }
            }
            CacheCommands::Clear => {
                let removed = self.service.clear_cache()?;
                println!("Cleared {removed} cache entries");
            }
        }
        Ok(())
    }

    pub async fn run_cleanup(&self) -> Result<(), Box<dyn std::error::Error>> {
        let scheduler = HousekeepingScheduler::new(
            Arc::new(self.service.cache().clone()),
            self.config.clone(),
            self.service.metrics(),
        );

        match scheduler.run_once().await {
            Some(result) => {
                let report = result?;
                println!("Housekeeping complete:");
                println!("  Cache rows purged: {}", report.rows_purged);
                println!("  Files deleted:     {}", report.files_deleted);
            }
            None => println!("Housekeeping already running"),
        }
        Ok(())
    }

    pub async fn show_health(&self) -> Result<(), Box<dyn std::error::Error>> {
        let stats = self.service.pool_stats().await;
        let entries = self.service.list_cache()?;
        let fresh = entries
            .iter()
            .filter(|e| !e.is_expired(self.config.cache_ttl))
            .count();

        println!("Render Engine:");
        println!("  Status: {:?}", stats.status);
        println!("  Live pages: {}", stats.live_pages);
        println!(
            "  Screenshots since restart: {}",
            stats.screenshots_since_restart
        );
        match stats.last_restart_age {
            Some(age) => println!("  Last restart: {age:?} ago"),
            None => println!("  Last restart: never"),
        }

        println!("\nCache Store:");
        println!("  Entries: {} ({} fresh)", entries.len(), fresh);
        println!("  TTL: {:?}", self.config.cache_ttl);

        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
