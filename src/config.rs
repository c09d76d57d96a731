//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::platform::MAX_MESSAGE_LENGTH;

/// Telegram Bot API configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Base URL of the Bot API, without trailing slash.
    pub api_base: String,
}

/// IMAP session behaviour.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    /// Connection attempts before the account is skipped for this cycle.
    pub connect_attempts: u32,
    /// Fixed sleep between connection attempts.
    pub connect_backoff: Duration,
    /// Socket read timeout.
    pub read_timeout: Duration,
    /// Append `max(ids) + 1` when the provider omits the newest message
    /// from a listing (observed on some providers).
    pub listing_quirk: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(100),
            read_timeout: Duration::from_secs(30),
            listing_quirk: true,
        }
    }
}

/// Poller scheduling.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// How many of the most recent ids a never-polled account starts with.
    pub initial_fetch_count: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_fetch_count: 5,
        }
    }
}

/// Broadcaster scheduling and delivery sizing.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// How long a queue fetch waits for work before the tick ends.
    pub fetch_timeout: Duration,
    /// Maximum characters per text segment.
    pub segment_size: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 10,
            fetch_timeout: Duration::from_millis(2000),
            segment_size: 3900,
        }
    }
}

/// Durable queue naming and lease.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub subject: String,
    pub durable: String,
    /// Un-acked jobs become visible again after this long.
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            subject: "mail.incoming".to_string(),
            durable: "broadcaster".to_string(),
            lease: Duration::from_secs(300),
        }
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub db_path: PathBuf,
    /// Root of the per-account attachment scratch directories.
    pub cache_dir: PathBuf,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    pub telegram: TelegramConfig,
    pub imap: ImapConfig,
    pub poller: PollerConfig,
    pub broadcaster: BroadcasterConfig,
    pub queue: QueueConfig,
}

impl RelayConfig {
    /// Build config from environment variables.
    ///
    /// Only `TELEGRAM_BOT_TOKEN` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;
        if bot_token.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TELEGRAM_BOT_TOKEN".into(),
                message: "must not be empty".into(),
            });
        }

        let api_base = std::env::var("TELEGRAM_API_BASE")
            .unwrap_or_else(|_| "https://api.telegram.org".to_string())
            .trim_end_matches('/')
            .to_string();

        let imap_defaults = ImapConfig::default();
        let poller_defaults = PollerConfig::default();
        let broadcaster_defaults = BroadcasterConfig::default();
        let queue_defaults = QueueConfig::default();

        let segment_size = check_segment_size(env_or(
            "MAIL_RELAY_SEGMENT_SIZE",
            broadcaster_defaults.segment_size,
        ))?;

        Ok(Self {
            db_path: std::env::var("MAIL_RELAY_DB_PATH")
                .unwrap_or_else(|_| "./data/mail-relay.db".to_string())
                .into(),
            cache_dir: std::env::var("MAIL_RELAY_CACHE_DIR")
                .unwrap_or_else(|_| "./data/cache".to_string())
                .into(),
            log_dir: std::env::var("MAIL_RELAY_LOG_DIR").ok().map(PathBuf::from),
            telegram: TelegramConfig {
                bot_token: SecretString::from(bot_token),
                api_base,
            },
            imap: ImapConfig {
                connect_attempts: env_or(
                    "MAIL_RELAY_IMAP_CONNECT_ATTEMPTS",
                    imap_defaults.connect_attempts,
                )
                .max(1),
                connect_backoff: Duration::from_millis(env_or(
                    "MAIL_RELAY_IMAP_CONNECT_BACKOFF_MS",
                    imap_defaults.connect_backoff.as_millis() as u64,
                )),
                read_timeout: imap_defaults.read_timeout,
                listing_quirk: env_or("MAIL_RELAY_IMAP_LISTING_QUIRK", imap_defaults.listing_quirk),
            },
            poller: PollerConfig {
                interval: tick_interval(env_or(
                    "MAIL_RELAY_POLL_INTERVAL_SECS",
                    poller_defaults.interval.as_secs(),
                )),
                initial_fetch_count: env_or(
                    "MAIL_RELAY_INITIAL_FETCH_COUNT",
                    poller_defaults.initial_fetch_count,
                ),
            },
            broadcaster: BroadcasterConfig {
                interval: tick_interval(env_or(
                    "MAIL_RELAY_BROADCAST_INTERVAL_SECS",
                    broadcaster_defaults.interval.as_secs(),
                )),
                batch_size: env_or(
                    "MAIL_RELAY_BROADCAST_BATCH_SIZE",
                    broadcaster_defaults.batch_size,
                )
                .max(1),
                fetch_timeout: Duration::from_millis(env_or(
                    "MAIL_RELAY_QUEUE_FETCH_TIMEOUT_MS",
                    broadcaster_defaults.fetch_timeout.as_millis() as u64,
                )),
                segment_size,
            },
            queue: QueueConfig {
                subject: std::env::var("MAIL_RELAY_QUEUE_SUBJECT")
                    .unwrap_or(queue_defaults.subject),
                durable: std::env::var("MAIL_RELAY_QUEUE_DURABLE")
                    .unwrap_or(queue_defaults.durable),
                lease: Duration::from_secs(env_or(
                    "MAIL_RELAY_QUEUE_LEASE_SECS",
                    queue_defaults.lease.as_secs(),
                )),
            },
        })
    }
}

/// Segments must be non-empty and fit in one platform message.
fn check_segment_size(size: usize) -> Result<usize, ConfigError> {
    if size == 0 || size > MAX_MESSAGE_LENGTH {
        return Err(ConfigError::InvalidValue {
            key: "MAIL_RELAY_SEGMENT_SIZE".into(),
            message: format!("must be between 1 and {MAX_MESSAGE_LENGTH}, got {size}"),
        });
    }
    Ok(size)
}

/// Scheduler period in seconds; zero would stall `tokio::time::interval`,
/// so it is raised to one second.
fn tick_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// Read and parse an environment variable, falling back to `default`
/// when it is unset or does not parse.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
