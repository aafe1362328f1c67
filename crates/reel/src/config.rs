use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Tunable constants for how far ahead and behind the feed is warmed.
///
/// `use_prepared_next_player` is a platform capability switch resolved once at construction;
/// hosts that cannot afford a second decoder set it to `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadPolicy {
    /// Players kept prepared behind the active index.
    pub prepared_prev: usize,
    /// Players kept prepared ahead of the active index.
    pub prepared_next: usize,
    /// Indices ahead that only get their bytes cached.
    pub disk_prefetch_next: usize,
    /// Upper bound on concurrent background downloads.
    pub max_concurrent_prefetch: usize,
    /// Bytes after which a disk prefetch counts as primed.
    pub preload_target_bytes: u64,
    /// Global byte budget of the on-disk cache.
    pub cache_max_bytes: u64,
    pub use_prepared_next_player: bool,
}

impl Default for PreloadPolicy {
    fn default() -> Self {
        Self {
            prepared_prev: 0,
            prepared_next: 1,
            disk_prefetch_next: 3,
            max_concurrent_prefetch: 2,
            preload_target_bytes: 1024 * 1024,
            cache_max_bytes: 256 * 1024 * 1024,
            use_prepared_next_player: true,
        }
    }
}

impl PreloadPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_prefetch == 0 {
            return Err(Error::configuration(
                "max_concurrent_prefetch must be at least 1",
            ));
        }
        if self.cache_max_bytes == 0 {
            return Err(Error::configuration("cache_max_bytes must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            max_delay_ms: 4000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate the delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        let final_delay = if self.use_jitter {
            // Add up to 25% jitter
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }

    /// Check if another retry should be attempted.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Network settings for media downloads.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Time to establish the TCP/TLS connection
    pub connect_timeout: Duration,

    /// Time until response headers arrive
    pub request_timeout: Duration,

    /// Maximum gap between two body chunks
    pub read_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request, before per-descriptor headers
    pub headers: BTreeMap<String, String>,

    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: BTreeMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero()
            || self.request_timeout.is_zero()
            || self.read_timeout.is_zero()
        {
            return Err(Error::configuration(
                "connect, request and read timeouts must all be finite and non-zero",
            ));
        }
        Ok(())
    }
}

/// Location and size bound of the on-disk media cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory; entries live in `media/`, partial downloads in `tmp/`
    pub root: PathBuf,
    pub max_bytes: u64,
    /// Downloads allowed to run at once
    pub max_concurrent: usize,
    pub fetch: FetchConfig,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>, policy: &PreloadPolicy) -> Self {
        Self {
            root: root.into(),
            max_bytes: policy.cache_max_bytes,
            max_concurrent: policy.max_concurrent_prefetch,
            fetch: FetchConfig::default(),
        }
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn media_dir(&self) -> PathBuf {
        self.root.join("media")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::configuration("cache max_bytes must be non-zero"));
        }
        if self.max_concurrent == 0 {
            return Err(Error::configuration(
                "cache must allow at least one concurrent download",
            ));
        }
        self.fetch.validate()
    }
}

/// Behaviour knobs of the coordinator itself.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval of the progress sampler
    pub progress_interval: Duration,
    /// Page offset fraction past which a neighbour is predicted
    pub scroll_hint_threshold: f32,
    /// Restart the active item when it ends
    pub loop_playback: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(1000),
            scroll_hint_threshold: 0.15,
            loop_playback: true,
        }
    }
}
