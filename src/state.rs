use std::time::Duration;

use crate::advance::{CursorHome, PickPolicy};
use crate::model::SLOT_COUNT;
use crate::reliability::retry::RetryConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub store_url: String,
    pub store_key: String,
    pub session_id: String,
    /// Fixed id of the singleton selection row.
    pub selection_row_id: i64,
    pub slot_count: usize,
    pub remote_timeout: Duration,
    pub pick_policy: PickPolicy,
    pub cursor_home: CursorHome,
    pub health_interval: Duration,
    pub health_failure_threshold: u32,
    pub heartbeat: Duration,
    pub feed_capacity: usize,
    pub startup_retries: u32,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            store_url: std::env::var("STORE_URL").unwrap_or(d.store_url),
            store_key: std::env::var("STORE_KEY").unwrap_or(d.store_key),
            session_id: std::env::var("SESSION_ID").unwrap_or(d.session_id),
            selection_row_id: env_parse("SELECTION_ROW_ID").unwrap_or(d.selection_row_id),
            slot_count: env_parse("SLOT_COUNT").filter(|n: &usize| *n > 0).unwrap_or(d.slot_count),
            remote_timeout: env_parse("REMOTE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.remote_timeout),
            pick_policy: env_parse("NEXT_PICK").unwrap_or(d.pick_policy),
            cursor_home: env_parse("CURSOR_HOME").unwrap_or(d.cursor_home),
            health_interval: env_parse("HEALTH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.health_interval),
            health_failure_threshold: env_parse("HEALTH_FAILURE_THRESHOLD").unwrap_or(d.health_failure_threshold),
            heartbeat: env_parse("HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.heartbeat),
            feed_capacity: env_parse("FEED_CAPACITY").unwrap_or(d.feed_capacity),
            startup_retries: env_parse("STARTUP_RETRIES").unwrap_or(d.startup_retries),
        }
    }

    pub fn startup_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.startup_retries,
            ..RetryConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: "http://localhost:54321".to_string(),
            store_key: String::new(),
            session_id: "default".to_string(),
            selection_row_id: 1,
            slot_count: SLOT_COUNT,
            remote_timeout: Duration::from_millis(5000),
            pick_policy: PickPolicy::TopRanked,
            cursor_home: CursorHome::First,
            health_interval: Duration::from_secs(5),
            health_failure_threshold: 3,
            heartbeat: Duration::from_secs(25),
            feed_capacity: 256,
            startup_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_grid() {
        let cfg = Config::default();
        assert_eq!(cfg.slot_count, 10);
        assert_eq!(cfg.session_id, "default");
        assert_eq!(cfg.selection_row_id, 1);
        assert_eq!(cfg.pick_policy, PickPolicy::TopRanked);
        assert_eq!(cfg.remote_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_startup_retry_uses_budget() {
        let cfg = Config {
            startup_retries: 7,
            ..Config::default()
        };
        assert_eq!(cfg.startup_retry().max_retries, 7);
    }
}
