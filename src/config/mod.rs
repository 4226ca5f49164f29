use std::env;
use std::path::PathBuf;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Database settings
    pub database: DatabaseConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Content matcher settings
    pub matcher: MatcherConfig,
    /// Cache/replay settings
    pub replay: ReplayConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Maximum pool connections
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    /// Human-readable output
    Pretty,
    /// Structured JSON output
    Json,
}

/// Content matcher tunables
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Fragments shorter than this never produce edges. Heuristic tunable,
    /// not a correctness contract.
    pub min_fragment_len: usize,
}

/// Cache/replay behaviour
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Subruns share the root session's cache namespace when true.
    pub share_subrun_cache: bool,
    /// Record failed endpoint calls as error-marker nodes.
    pub record_failures: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("FLOWTRACE_DATABASE_PATH")
                    .unwrap_or_else(|_| "./data/flowtrace.db".to_string()),
            ),
            max_connections: env::var("FLOWTRACE_DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("FLOWTRACE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("FLOWTRACE_LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let matcher = MatcherConfig {
            min_fragment_len: env::var("FLOWTRACE_MIN_FRAGMENT_LEN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(MatcherConfig::DEFAULT_MIN_FRAGMENT_LEN),
        };

        let replay = ReplayConfig {
            share_subrun_cache: env::var("FLOWTRACE_SHARE_SUBRUN_CACHE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            record_failures: env::var("FLOWTRACE_RECORD_FAILURES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
        };

        Config {
            database,
            logging,
            matcher,
            replay,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            matcher: MatcherConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/flowtrace.db"),
            max_connections: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl MatcherConfig {
    /// Default minimum fragment length in characters.
    pub const DEFAULT_MIN_FRAGMENT_LEN: usize = 10;
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_fragment_len: Self::DEFAULT_MIN_FRAGMENT_LEN,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            share_subrun_cache: true,
            record_failures: true,
        }
    }
}

/// Initialize tracing/logging for embedding programs
pub fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
