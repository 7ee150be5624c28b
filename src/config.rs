// src/config.rs

use std::time::Duration;

/// Environment-driven knobs (spec §6). All have defaults so the process
/// runs unconfigured in dev the same way the teacher's `dotenv`-backed
/// binaries do.
#[derive(Debug, Clone)]
pub struct Settings {
    pub parallel_limit: usize,
    pub scraping_pause_timeout: Duration,
    pub stale_listing_hours: i64,
    pub stall_running_threshold: Duration,
    pub stall_paused_threshold: Duration,
    pub detail_refetch_hours: i64,
    pub duplicate_cache_ttl: Duration,
    pub recent_updates_cache_ttl: Duration,
    pub http_retries: u32,
    pub http_timeout: Duration,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            parallel_limit: env_u64("PARALLEL_LIMIT", 3) as usize,
            scraping_pause_timeout: Duration::from_secs(env_u64("SCRAPING_PAUSE_TIMEOUT", 1800)),
            stale_listing_hours: env_i64("STALE_LISTING_HOURS", 24),
            stall_running_threshold: Duration::from_secs(
                env_u64("STALL_RUNNING_THRESHOLD_MINUTES", 10) * 60,
            ),
            stall_paused_threshold: Duration::from_secs(
                env_u64("STALL_PAUSED_THRESHOLD_MINUTES", 30) * 60,
            ),
            detail_refetch_hours: env_i64("DETAIL_REFETCH_HOURS", 72),
            duplicate_cache_ttl: Duration::from_secs(env_u64("DUPLICATE_CACHE_TTL_SECONDS", 300)),
            recent_updates_cache_ttl: Duration::from_secs(env_u64(
                "RECENT_UPDATES_CACHE_TTL_SECONDS",
                1800,
            )),
            http_retries: env_u64("HTTP_RETRIES", 3) as u32,
            http_timeout: Duration::from_secs(env_u64("HTTP_TIMEOUT_SECONDS", 10)),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        std::env::remove_var("PARALLEL_LIMIT");
        std::env::remove_var("SCRAPING_PAUSE_TIMEOUT");
        let s = Settings::from_env();
        assert_eq!(s.parallel_limit, 3);
        assert_eq!(s.scraping_pause_timeout, Duration::from_secs(1800));
        assert_eq!(s.stale_listing_hours, 24);
        assert_eq!(s.detail_refetch_hours, 72);
        assert_eq!(s.http_retries, 3);
        assert_eq!(s.http_timeout, Duration::from_secs(10));
    }
}
