//! Crawl configuration, read from the environment.
//!
//! Every knob has a default; CLI flags override the environment afterwards.

use crate::error::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_WRITE_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_WRITE_RETRY_LIMIT: u32 = 60;
const DEFAULT_FAULT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_RESET_RETRY_DELAY_MS: u64 = 60_000;
const DEFAULT_LEASE_SECS: u64 = 600;
const DEFAULT_INTERACTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BASE_URL: &str = "http://veiculos.fipe.org.br/";

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Persistent store connection string.
    pub database_url: String,
    pub write_retry: RetryPolicy,
    /// Fixed delay before a faulted node is attempted again.
    pub fault_retry_delay: Duration,
    /// Delay between failed session rebuild attempts.
    pub reset_retry_delay: Duration,
    /// Consecutive faults on one node before escalating; `0` never escalates.
    pub max_consecutive_faults: u32,
    pub lease: Duration,
    pub base_url: String,
    pub chromium_path: Option<PathBuf>,
    pub interaction_timeout: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let u64_or = |name: &str, default_value: u64| {
            string(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default_value)
        };
        let u32_or = |name: &str, default_value: u32| {
            string(name)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default_value)
        };

        Self {
            database_url: string("FIPE_DATABASE_URL").unwrap_or_else(default_database_url),
            write_retry: RetryPolicy::new(
                Duration::from_millis(u64_or(
                    "FIPE_WRITE_RETRY_DELAY_MS",
                    DEFAULT_WRITE_RETRY_DELAY_MS,
                )),
                u32_or("FIPE_WRITE_RETRY_LIMIT", DEFAULT_WRITE_RETRY_LIMIT),
            ),
            fault_retry_delay: Duration::from_millis(u64_or(
                "FIPE_FAULT_RETRY_DELAY_MS",
                DEFAULT_FAULT_RETRY_DELAY_MS,
            )),
            reset_retry_delay: Duration::from_millis(u64_or(
                "FIPE_RESET_RETRY_DELAY_MS",
                DEFAULT_RESET_RETRY_DELAY_MS,
            )),
            max_consecutive_faults: u32_or("FIPE_MAX_CONSECUTIVE_FAULTS", 0),
            lease: Duration::from_secs(u64_or("FIPE_LEASE_SECS", DEFAULT_LEASE_SECS).max(1)),
            base_url: string("FIPE_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            chromium_path: string("FIPE_CHROMIUM_PATH").map(PathBuf::from),
            interaction_timeout: Duration::from_millis(u64_or(
                "FIPE_INTERACTION_TIMEOUT_MS",
                DEFAULT_INTERACTION_TIMEOUT_MS,
            )),
        }
    }

    /// Zero delays everywhere; used for simulated runs and tests.
    pub fn without_delays(mut self) -> Self {
        self.write_retry.delay = Duration::ZERO;
        self.fault_retry_delay = Duration::ZERO;
        self.reset_retry_delay = Duration::ZERO;
        self
    }
}

/// `sqlite://~/.fipe/fipe.db`
fn default_database_url() -> String {
    let path = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fipe")
        .join("fipe.db");
    format!("sqlite://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = CrawlConfig::default();
        assert!(cfg.database_url.starts_with("sqlite://"));
        assert!(cfg.database_url.ends_with("fipe.db"));
        assert_eq!(cfg.write_retry.delay, Duration::from_secs(1));
        assert_eq!(cfg.write_retry.max_attempts, 60);
        assert_eq!(cfg.max_consecutive_faults, 0);
        assert_eq!(cfg.lease, Duration::from_secs(600));
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert!(cfg.chromium_path.is_none());
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FIPE_DATABASE_URL", "sqlite::memory:"),
            ("FIPE_WRITE_RETRY_LIMIT", "0"),
            ("FIPE_FAULT_RETRY_DELAY_MS", "5"),
            ("FIPE_MAX_CONSECUTIVE_FAULTS", "3"),
            ("FIPE_LEASE_SECS", "0"),
            ("FIPE_CHROMIUM_PATH", "/opt/chrome"),
        ]
        .into_iter()
        .collect();
        let cfg = CrawlConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.write_retry.max_attempts, 0);
        assert_eq!(cfg.fault_retry_delay, Duration::from_millis(5));
        assert_eq!(cfg.max_consecutive_faults, 3);
        // Lease is never zero.
        assert_eq!(cfg.lease, Duration::from_secs(1));
        assert_eq!(cfg.chromium_path, Some(PathBuf::from("/opt/chrome")));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let cfg = CrawlConfig::from_lookup(|name| match name {
            "FIPE_WRITE_RETRY_DELAY_MS" => Some("soon".to_string()),
            "FIPE_DATABASE_URL" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(cfg.write_retry.delay, Duration::from_secs(1));
        assert!(cfg.database_url.starts_with("sqlite://"));
    }

    #[test]
    fn test_without_delays() {
        let cfg = CrawlConfig::default().without_delays();
        assert_eq!(cfg.write_retry.delay, Duration::ZERO);
        assert_eq!(cfg.fault_retry_delay, Duration::ZERO);
        assert_eq!(cfg.reset_retry_delay, Duration::ZERO);
    }
}
