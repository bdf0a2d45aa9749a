//! blockcache - read remote and slow local objects through a persistent block cache
//!
//! Every invocation shares the same cache directory, so blocks fetched by one
//! run (or by a concurrent one) are served from disk by the next.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use blockcache::{CacheConfig, CacheManager, HttpStore, LocalStore, ObjectStore};

/// What to do with a source
#[derive(Debug)]
enum Action {
    /// Write bytes `[start, end)` to stdout
    Read { start: u64, end: Option<u64> },
    /// Stream the whole object into the cache
    Prefetch,
    /// Show cached block counts
    Status,
}

/// CLI command
#[derive(Debug)]
enum Command {
    Run { source: String, action: Action },
    Help,
}

fn print_help() {
    eprintln!(
        r#"blockcache - Persistent block cache for remote byte ranges

USAGE:
    blockcache read <source> [start] [end]
    blockcache prefetch <source>
    blockcache status <source>
    blockcache help

COMMANDS:
    read      Write bytes [start, end) of the source to stdout (default: all)
    prefetch  Stream the whole source into the cache and wait for it
    status    Show how many blocks of the source are cached
    help      Show this help message

SOURCES:
    http:// and https:// URLs are fetched with ranged requests.
    Anything else is a local file path.

EXAMPLES:
    blockcache read https://example.com/data.bin 0 1048576 > head.bin
    blockcache prefetch https://example.com/data.bin
    blockcache status https://example.com/data.bin

ENVIRONMENT:
    BLOCKCACHE_CONFIG      JSON config file
    BLOCKCACHE_DIR         Cache directory
    BLOCKCACHE_BLOCK_SIZE  Block size in bytes
    BLOCKCACHE_TIMEOUT_MS  Wait on another reader this long before taking over
    RUST_LOG               Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_offset(value: &str, name: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow!("{} must be a byte offset, got {:?}", name, value))
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    let action = match args[1].as_str() {
        "read" => {
            let start = match args.get(3) {
                Some(value) => parse_offset(value, "start")?,
                None => 0,
            };
            let end = args.get(4).map(|value| parse_offset(value, "end")).transpose()?;
            Action::Read { start, end }
        }
        "prefetch" => Action::Prefetch,
        "status" => Action::Status,
        "help" | "--help" | "-h" => return Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            return Ok(Command::Help);
        }
    };

    let source = args
        .get(2)
        .cloned()
        .ok_or_else(|| anyhow!("Usage: blockcache {} <source>", args[1]))?;
    Ok(Command::Run { source, action })
}

fn load_config() -> Result<CacheConfig> {
    let config = match env::var("BLOCKCACHE_CONFIG") {
        Ok(path) => CacheConfig::from_json_file(Path::new(&path))?,
        Err(_) => CacheConfig::default(),
    };
    Ok(config.apply_env()?)
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn execute<S, F>(config: CacheConfig, factory: F, id: &str, action: Action) -> Result<()>
where
    S: ObjectStore,
    F: Fn() -> Result<Arc<S>> + Send + Sync + 'static,
{
    let manager = CacheManager::new(config, factory)?;
    let total = manager
        .size(id)
        .with_context(|| format!("Failed to get size of {}", id))?;

    match action {
        Action::Read { start, end } => {
            let end = end.unwrap_or(total);
            let bytes = manager.read(id, total, start, end)?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
            info!(source = id, start = start, end = end, "Read complete");
        }
        Action::Prefetch => {
            let bytes = manager.prefetch(id, total)?.wait()?;
            info!(source = id, bytes = bytes, "Prefetch finished");
        }
        Action::Status => {
            let status = manager.status(id, total)?;
            println!("source:   {}", id);
            println!("size:     {}", total);
            println!("blocks:   {}/{}", status.done, status.blocks);
            println!("complete: {}", status.complete);
            println!("files:    {}", manager.paths(id).data.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Logs go to stderr so `read` output stays clean
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let (source, action) = match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Run { source, action } => (source, action),
    };

    let config = load_config()?;
    info!(cache_dir = %config.cache_dir.display(), "Using cache directory");

    if is_url(&source) {
        execute(config, || Ok(Arc::new(HttpStore::new()?)), &source, action)
    } else {
        let path: PathBuf = std::fs::canonicalize(&source)
            .with_context(|| format!("Failed to resolve {}", source))?;
        let id = path.to_string_lossy().into_owned();
        execute(config, || Ok(Arc::new(LocalStore::new("/"))), &id, action)
    }
}
