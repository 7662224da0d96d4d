//! covercache - TTL cover cache maintenance CLI

mod cli;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use covercache_core::{
    ExpirationMode, HttpConfig, HttpSource, ResourceRegistry, StoreConfig, StoreEvent, TtlStore,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "covercache",
    version,
    about = "Inspect the covercache TTL store and fetch covers",
    long_about = "Maintenance tool for the persisted covercache TTL store.\n\
                  \n\
                  Entries live in two scopes: persisted (short, long, not-expired) entries\n\
                  are written to the cache file, session (one-session) entries only last\n\
                  for the current process.\n\
                  \n\
                  Examples:\n\
                    covercache list                          # Show live entries\n\
                    covercache put provider musicbrainz      # Store a never-expiring entry\n\
                    covercache put search:x id --mode short  # Store with the short TTL\n\
                    covercache get provider                  # Print one value\n\
                    covercache purge                         # Rewrite the file without stale entries\n\
                    covercache fetch URL -n 8 -o cover.jpg   # 8 consumers, one download\n\
                  \n\
                  Environment Variables:\n\
                    COVERCACHE_FILE                          # Override the cache file path\n\
                    COVERCACHE_NO_COLOR                      # Disable ANSI colors\n\
                    RUST_LOG                                 # Log filter (default: warn)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the cache file (default: <cache dir>/covercache/cache.bin)
    #[arg(long, env = "COVERCACHE_FILE", global = true)]
    cache_file: Option<PathBuf>,

    /// Disable ANSI colors (log-friendly)
    #[arg(long, env = "COVERCACHE_NO_COLOR", global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List live entries
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the value stored under a key
    Get {
        key: String,
    },
    /// Store a value
    Put {
        key: String,
        value: String,
        /// Expiration mode: short, long, one-session, not-expired
        #[arg(long, short = 'm', default_value = "not-expired")]
        mode: ExpirationMode,
    },
    /// Remove a key
    Remove {
        key: String,
    },
    /// Drop expired entries and rewrite the cache file
    Purge,
    /// Show store counters
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download a URL through one shared single-flight resource
    Fetch {
        url: String,
        /// Number of concurrent consumers
        #[arg(long, short = 'n', default_value = "1")]
        consumers: usize,
        /// Write the downloaded bytes to this file
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color)
        .init();

    let config = match cli.cache_file {
        Some(path) => StoreConfig::with_path(path),
        None => StoreConfig::default(),
    };
    let no_color = cli.no_color;

    match cli.command {
        Command::List { json } => run_list(config, json, no_color),
        Command::Get { key } => run_get(config, &key),
        Command::Put { key, value, mode } => run_put(config, key, value, mode).await,
        Command::Remove { key } => run_remove(config, &key).await,
        Command::Purge => run_purge(config).await,
        Command::Stats { json } => run_stats(config, json),
        Command::Fetch {
            url,
            consumers,
            output,
            timeout,
            json,
        } => run_fetch(url, consumers, output, timeout, json, no_color).await,
    }
}

fn run_list(config: StoreConfig, json: bool, no_color: bool) -> Result<()> {
    let store: TtlStore<String> = TtlStore::new(config);
    let entries = store.snapshot();
    println!(
        "{}",
        cli::format_entries(&entries, chrono::Utc::now(), json, no_color)
    );
    Ok(())
}

fn run_get(config: StoreConfig, key: &str) -> Result<()> {
    let store: TtlStore<String> = TtlStore::new(config);
    match store.get(key) {
        Some(value) => {
            println!("{}", value);
            Ok(())
        }
        None => bail!("No live entry for '{}'", key),
    }
}

async fn run_put(
    config: StoreConfig,
    key: String,
    value: String,
    mode: ExpirationMode,
) -> Result<()> {
    let store: TtlStore<String> = TtlStore::new(config);
    store.add(key.clone(), value, mode);
    // Always flush: a session entry may have replaced a persisted one
    let persisted = flush(&store).await?;

    if mode.is_persisted() {
        println!("Stored '{}' ({}), {} persisted entries", key, mode, persisted);
    } else {
        println!(
            "Stored '{}' ({}), session entries are dropped when the process exits",
            key, mode
        );
    }
    Ok(())
}

async fn run_remove(config: StoreConfig, key: &str) -> Result<()> {
    let store: TtlStore<String> = TtlStore::new(config);
    if !store.remove(key) {
        bail!("No entry for '{}'", key);
    }
    flush(&store).await?;
    println!("Removed '{}'", key);
    Ok(())
}

async fn run_purge(config: StoreConfig) -> Result<()> {
    let store: TtlStore<String> = TtlStore::new(config);
    let mut events = store.subscribe();

    let purged = store.purge_expired();
    let skipped_on_load = match events.try_recv() {
        Ok(StoreEvent::Loaded { expired, .. }) => expired,
        Ok(StoreEvent::LoadFailed(message)) => {
            bail!("Cache file could not be read: {}", message)
        }
        _ => 0,
    };

    let total = purged + skipped_on_load;
    if total == 0 {
        println!("No expired entries");
        return Ok(());
    }

    let remaining = flush(&store).await?;
    println!("Purged {} expired entries, {} remaining", total, remaining);
    Ok(())
}

fn run_stats(config: StoreConfig, json: bool) -> Result<()> {
    let path = config.path.clone();
    let store: TtlStore<String> = TtlStore::new(config);
    store.preload();
    println!("{}", cli::format_stats(&store.stats(), &path, json));
    Ok(())
}

async fn run_fetch(
    url: String,
    consumers: usize,
    output: Option<PathBuf>,
    timeout: u64,
    json: bool,
    no_color: bool,
) -> Result<()> {
    if consumers == 0 {
        bail!("--consumers must be at least 1");
    }

    let source = HttpSource::new(HttpConfig {
        timeout: Duration::from_secs(timeout),
        ..HttpConfig::default()
    })
    .context("Failed to build HTTP client")?;
    let registry = ResourceRegistry::with_source(source);

    let mut tasks = tokio::task::JoinSet::new();
    for consumer in 0..consumers {
        // Every consumer looks the URL up on its own, as independent views would
        let resource = registry
            .cover(&url)
            .context("Registry has no HTTP source")?;
        tasks.spawn(async move { (consumer, resource.fetch().await) });
    }

    let mut reports = Vec::with_capacity(consumers);
    let mut first_stream = None;
    while let Some(joined) = tasks.join_next().await {
        let (consumer, result) = joined.context("Consumer task panicked")?;
        let result = result.map(|stream| {
            let len = stream.len();
            if first_stream.is_none() {
                first_stream = Some(stream);
            }
            len
        });
        reports.push(cli::ConsumerReport { consumer, result });
    }
    reports.sort_by_key(|report| report.consumer);

    let invocations = registry
        .get(&url)
        .map(|resource| resource.invocations())
        .unwrap_or(0);
    println!(
        "{}",
        cli::format_fetch_report(&url, &reports, invocations, json, no_color)
    );

    if let Some(path) = output {
        let stream = first_stream.context("Download failed, nothing to write")?;
        write_output(&path, stream.as_slice()).await?;
        if !json {
            println!("Wrote {} to {}", cli::format_bytes(stream.len()), path.display());
        }
    }

    Ok(())
}

/// Write the persisted map off the async thread
async fn flush(store: &TtlStore<String>) -> Result<usize> {
    let path = store.config().path.clone();
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.flush())
        .await
        .context("Flush task panicked")?
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
