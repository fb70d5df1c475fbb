use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use idgen::{DEFAULT_MAX_BATCH_SIZE, RetryPolicy};
use std::path::PathBuf;

/// Runtime configuration for the `idgen-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is honoured), with defaults suitable for a single node.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "idgen-server",
    version,
    author,
    about = "An HTTP service for identifier sources and batch exports"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Largest batch a single export may request.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    pub max_batch_size: usize,

    /// Attempts made against a remote source before giving up.
    ///
    /// Environment variable: `REMOTE_MAX_ATTEMPTS`
    #[arg(long, env = "REMOTE_MAX_ATTEMPTS", default_value_t = 3)]
    pub remote_max_attempts: u32,

    /// Delay after the first failed remote attempt, doubled after each
    /// further failure.
    ///
    /// Environment variable: `REMOTE_BACKOFF_MS`
    #[arg(long, env = "REMOTE_BACKOFF_MS", default_value_t = 200)]
    pub remote_backoff_ms: u64,

    /// Timeout of a single remote request.
    ///
    /// Environment variable: `REMOTE_TIMEOUT_MS`
    #[arg(long, env = "REMOTE_TIMEOUT_MS", default_value_t = 10_000)]
    pub remote_timeout_ms: u64,

    /// Interval of the background sweep that tops pools up to their
    /// low-water mark. `0` disables the sweep.
    ///
    /// Environment variable: `REFILL_INTERVAL_SECS`
    #[arg(long, env = "REFILL_INTERVAL_SECS", default_value_t = 60)]
    pub refill_interval_secs: u64,

    /// Append the audit log to this JSON-lines file instead of keeping it in
    /// memory.
    ///
    /// Environment variable: `AUDIT_LOG_PATH`
    #[arg(long, env = "AUDIT_LOG_PATH")]
    pub audit_log_path: Option<PathBuf>,

    /// How long in-flight requests may run after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub max_batch_size: usize,
    pub retry: RetryPolicy,
    pub remote_timeout: Duration,
    pub refill_interval: Option<Duration>,
    pub audit_log_path: Option<PathBuf>,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be greater than 0");
        }

        if args.remote_max_attempts == 0 {
            bail!("REMOTE_MAX_ATTEMPTS must be greater than 0");
        }

        if args.remote_timeout_ms == 0 {
            bail!("REMOTE_TIMEOUT_MS must be greater than 0");
        }

        let backoff = Duration::from_millis(args.remote_backoff_ms);
        let retry = RetryPolicy {
            max_attempts: args.remote_max_attempts,
            backoff,
            max_backoff: RetryPolicy::default().max_backoff.max(backoff),
            ..RetryPolicy::default()
        };

        Ok(Self {
            server_addr: args.server_addr,
            max_batch_size: args.max_batch_size,
            retry,
            remote_timeout: Duration::from_millis(args.remote_timeout_ms),
            refill_interval: (args.refill_interval_secs > 0)
                .then(|| Duration::from_secs(args.refill_interval_secs)),
            audit_log_path: args.audit_log_path,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}
