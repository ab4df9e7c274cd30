//! Periodic reachability check of the remote store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::reliability::circuit::CircuitBreaker;
use crate::store::{with_timeout, RemoteStore};

#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub online: bool,
    pub latency_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
    pub error: Option<String>,
}

impl HealthStatus {
    /// Assumed state before the first check.
    pub fn unknown() -> Self {
        Self {
            online: true,
            latency_ms: None,
            last_check: Utc::now(),
            error: None,
        }
    }
}

pub struct HealthMonitor {
    store: Arc<dyn RemoteStore>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn RemoteStore>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(failure_threshold),
            timeout,
        }
    }

    /// One ping. The store counts as offline only once the breaker trips,
    /// and as online again on the first success.
    pub async fn check(&mut self) -> HealthStatus {
        let started = Instant::now();
        let result = with_timeout(self.timeout, self.store.ping()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                if self.breaker.record_success() {
                    log(
                        Level::Info,
                        Domain::Health,
                        "store_online",
                        obj(&[("latency_ms", v_num(latency_ms as f64))]),
                    );
                }
                HealthStatus {
                    online: true,
                    latency_ms: Some(latency_ms),
                    last_check: Utc::now(),
                    error: None,
                }
            }
            Err(err) => {
                let message = err.to_string();
                if self.breaker.record_failure() {
                    log(
                        Level::Error,
                        Domain::Health,
                        "store_offline",
                        obj(&[
                            ("consecutive_failures", v_num(self.breaker.consecutive_failures() as f64)),
                            ("error", v_str(&message)),
                        ]),
                    );
                }
                HealthStatus {
                    online: self.breaker.is_closed(),
                    latency_ms: None,
                    last_check: Utc::now(),
                    error: Some(message),
                }
            }
        }
    }

    /// Checks every `interval` and publishes each result. The task ends once
    /// every receiver is dropped.
    pub fn spawn(mut self, interval: Duration) -> (watch::Receiver<HealthStatus>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(HealthStatus::unknown());
        let period = interval.max(Duration::from_millis(100));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let status = self.check().await;
                if tx.send(status).is_err() {
                    break;
                }
            }
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn monitor(store: &Arc<MemoryStore>, threshold: u32) -> HealthMonitor {
        let remote: Arc<dyn RemoteStore> = store.clone();
        HealthMonitor::new(remote, threshold, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_online_reports_latency() {
        let store = Arc::new(MemoryStore::new());
        let status = monitor(&store, 2).check().await;
        assert!(status.online);
        assert!(status.latency_ms.is_some());
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_offline_after_threshold_and_back() {
        let store = Arc::new(MemoryStore::new());
        let mut mon = monitor(&store, 2);
        store.set_offline(true);
        let first = mon.check().await;
        assert!(first.online);
        assert!(first.error.is_some());
        assert!(!mon.check().await.online);

        store.set_offline(false);
        assert!(mon.check().await.online);
    }

    #[tokio::test]
    async fn test_spawn_publishes() {
        let store = Arc::new(MemoryStore::new());
        let (mut rx, handle) = monitor(&store, 1).spawn(Duration::from_millis(100));
        rx.changed().await.unwrap();
        assert!(rx.borrow().online);
        drop(rx);
        handle.abort();
    }
}
