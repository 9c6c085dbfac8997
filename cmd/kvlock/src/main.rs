use clap::{Parser, Subcommand};
use pkg_concurrency::{RetryPolicy, SessionOptions};
use pkg_constants::lock::{DEFAULT_LOCK_NAME, DEMO_HOLD_SECS};
use pkg_constants::paths::DEFAULT_CLIENT_CONFIG;
use pkg_state::{Coordinator, StateStore};
use pkg_types::config::{ClientConfigFile, load_config_file};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser, Debug)]
#[command(
    name = "kvlock",
    about = "Walk through the coordinator client API and the distributed mutex"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CLIENT_CONFIG)]
    config: String,

    /// Session lease TTL in seconds
    #[arg(long, global = true)]
    ttl: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Put a key and read it back
    Access,
    /// Write ten keys and read them back by prefix
    Prefix,
    /// Delete a single key, then a whole prefix
    Delete,
    /// Compare-and-swap: delete user1 if it is "bad", else set it to "good"
    Txn,
    /// Watch a prefix while another task writes to it
    Watch {
        /// Index of the last key written (count + 1 writes in total)
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Pause between writes in milliseconds
        #[arg(long, default_value_t = 3000)]
        interval_ms: u64,
    },
    /// Attach a key to a lease, renew it once, then revoke it
    Lease {
        /// TTL of the demo lease in seconds
        #[arg(long, default_value_t = 300)]
        lease_ttl: u64,
    },
    /// Two sessions contending for one mutex
    Lock {
        /// Lock name
        #[arg(long)]
        name: Option<String>,
        /// Seconds the first session holds the lock
        #[arg(long)]
        hold: Option<u64>,
    },
    /// Run every demo in order
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ClientConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let options = session_options(cli.ttl, &file_cfg);
    let lock_name = |name: Option<String>| {
        name.or_else(|| file_cfg.lock_name.clone())
            .unwrap_or_else(|| DEFAULT_LOCK_NAME.to_string())
    };
    let hold = |hold: Option<u64>| {
        Duration::from_secs(hold.or(file_cfg.hold_secs).unwrap_or(DEMO_HOLD_SECS))
    };

    info!("Starting kvlock");
    info!("  Session TTL: {}s", options.ttl_secs);
    info!("  Retry:       {:?}", options.retry);

    let store: Arc<dyn Coordinator> = Arc::new(StateStore::new());

    match cli.command {
        Commands::Access => demo::access(store.as_ref()).await?,
        Commands::Prefix => demo::get_by_prefix(store.as_ref()).await?,
        Commands::Delete => demo::delete(store.as_ref()).await?,
        Commands::Txn => demo::transactional_write(store.as_ref()).await?,
        Commands::Watch { count, interval_ms } => {
            demo::watch(store, count, Duration::from_millis(interval_ms)).await?
        }
        Commands::Lease { lease_ttl } => {
            demo::lease(store, Duration::from_secs(lease_ttl), options.retry).await?
        }
        Commands::Lock { name, hold: hold_secs } => {
            demo::distributed_locks(store, options, &lock_name(name), hold(hold_secs)).await?
        }
        Commands::All => {
            demo::access(store.as_ref()).await?;
            demo::get_by_prefix(store.as_ref()).await?;
            demo::delete(store.as_ref()).await?;
            demo::transactional_write(store.as_ref()).await?;
            demo::watch(store.clone(), 10, Duration::from_secs(3)).await?;
            demo::lease(store.clone(), Duration::from_secs(300), options.retry).await?;
            demo::distributed_locks(store, options, &lock_name(None), hold(None)).await?;
        }
    }

    Ok(())
}

fn session_options(ttl: Option<i64>, file_cfg: &ClientConfigFile) -> SessionOptions {
    let mut options = SessionOptions::default();
    if let Some(ttl) = ttl.or(file_cfg.ttl) {
        options.ttl_secs = ttl;
    }
    if let Some(max_failures) = file_cfg.keepalive_max_failures {
        options.keepalive_max_failures = max_failures;
    }
    if let Some(retry) = &file_cfg.retry {
        let defaults = RetryPolicy::default();
        options.retry = RetryPolicy {
            max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: retry
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: retry
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        };
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::config::RetryConfigFile;

    #[test]
    fn test_cli_ttl_overrides_file() {
        let file_cfg = ClientConfigFile {
            ttl: Some(30),
            ..Default::default()
        };
        assert_eq!(session_options(Some(5), &file_cfg).ttl_secs, 5);
        assert_eq!(session_options(None, &file_cfg).ttl_secs, 30);
        assert_eq!(
            session_options(None, &ClientConfigFile::default()).ttl_secs,
            60
        );
    }

    #[test]
    fn test_partial_retry_config_keeps_defaults() {
        let file_cfg = ClientConfigFile {
            retry: Some(RetryConfigFile {
                max_attempts: Some(9),
                ..Default::default()
            }),
            ..Default::default()
        };
        let retry = session_options(None, &file_cfg).retry;
        assert_eq!(retry.max_attempts, 9);
        assert_eq!(retry.initial_backoff, RetryPolicy::default().initial_backoff);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["kvlock", "--ttl", "2", "lock", "--hold", "1"]).unwrap();
        assert_eq!(cli.ttl, Some(2));
        assert!(matches!(
            cli.command,
            Commands::Lock {
                name: None,
                hold: Some(1)
            }
        ));
    }
}
