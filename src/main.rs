use clap::Parser;
use color_eyre::eyre::Result;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pixcache::infrastructure::{AppConfig, CliArgs, Command, DiskImageCache, ImageRuntime, StorageManager};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let storage = StorageManager::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Serialize)]
struct DiskReport {
    cache_dir: String,
    entries: usize,
    size_bytes: u64,
    max_size_bytes: u64,
}

async fn open_disk(config: &AppConfig) -> Result<DiskImageCache> {
    Ok(DiskImageCache::new(config.effective_cache_dir(), config.cache.disk_max_size).await?)
}

async fn fetch(config: &AppConfig, urls: Vec<String>) -> Result<()> {
    let runtime = ImageRuntime::init(config).await?;
    let loader = runtime.loader();

    let results = join_all(urls.iter().map(|url| loader.load(url))).await;
    let mut failures = 0usize;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(loaded) => println!(
                "{url}: {}x{} from {}",
                loaded.image.width(),
                loaded.image.height(),
                loaded.source
            ),
            Err(e) => {
                failures += 1;
                println!("{url}: {e}");
            }
        }
    }

    println!("{}", loader.memory_cache_stats());
    runtime.shutdown().await;

    if failures > 0 {
        color_eyre::eyre::bail!("{failures} of {} images failed to load", urls.len());
    }
    Ok(())
}

async fn stats(config: &AppConfig, json: bool) -> Result<()> {
    let disk = open_disk(config).await?;
    let report = DiskReport {
        cache_dir: disk.cache_dir().display().to_string(),
        entries: disk.len().await,
        size_bytes: disk.current_size().await,
        max_size_bytes: disk.max_size(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Cache directory: {}", report.cache_dir);
        println!("Entries:         {}", report.entries);
        println!(
            "Size:            {} / {} bytes",
            report.size_bytes, report.max_size_bytes
        );
    }
    Ok(())
}

async fn clear(config: &AppConfig) -> Result<()> {
    let disk = open_disk(config).await?;
    let entries = disk.len().await;
    disk.clear().await;
    println!("Removed {entries} cached images from {}", disk.cache_dir().display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = pixcache::VERSION, "Starting {}", pixcache::NAME);

    match args.command.clone().unwrap_or_default() {
        Command::Fetch { urls } => fetch(&config, urls).await,
        Command::Stats { json } => stats(&config, json).await,
        Command::Clear => clear(&config).await,
    }
}
