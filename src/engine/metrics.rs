// Subscription counters

//! # Counters
//!
//! Three numbers describe the engine from the outside: active
//! subscriptions, open connections and messages sent. They are updated with
//! atomics at fixed points of the lifecycle and never under a Binding lock.
//!
//! A process-wide instance is available through [`Counters::global`]; every
//! component also accepts an injected `Arc<Counters>` so tests running in
//! parallel each observe their own numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

lazy_static! {
    static ref GLOBAL_COUNTERS: Arc<Counters> = Arc::new(Counters::new());
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct Counters {
    active_subscriptions: AtomicU64,
    open_connections: AtomicU64,
    messages_sent: AtomicU64,
}

/// Point-in-time copy of the counters, served on `/health/subscriptions`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub active_subscriptions: u64,
    pub open_connections: u64,
    pub messages_sent: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance, created on first use
    pub fn global() -> Arc<Counters> {
        Arc::clone(&GLOBAL_COUNTERS)
    }

    pub fn subscription_added(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn subscription_removed(&self) {
        decrement(&self.active_subscriptions);
    }

    pub fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connection_closed(&self) {
        decrement(&self.open_connections);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::AcqRel);
    }

    pub fn active_subscriptions(&self) -> u64 {
        self.active_subscriptions.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Acquire)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            active_subscriptions: self.active_subscriptions(),
            open_connections: self.open_connections(),
            messages_sent: self.messages_sent(),
        }
    }

    /// Polls until exactly `count` subscriptions are active
    pub async fn wait_for_subscription_count(&self, count: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |c| c.active_subscriptions() == count).await
    }

    /// Polls until exactly `count` connections are open
    pub async fn wait_for_connection_count(&self, count: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |c| c.open_connections() == count).await
    }

    /// Polls until at least `count` messages were sent
    pub async fn wait_for_messages_sent(&self, count: u64, timeout: Duration) -> bool {
        self.wait_until(timeout, |c| c.messages_sent() >= count).await
    }

    async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&Counters) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// Saturating so a stray double release can never wrap around
fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        Some(value.saturating_sub(1))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_updates() {
        let counters = Counters::new();
        counters.connection_opened();
        counters.subscription_added();
        counters.subscription_added();
        counters.message_sent();
        counters.subscription_removed();

        assert_eq!(
            counters.snapshot(),
            CountersSnapshot {
                active_subscriptions: 1,
                open_connections: 1,
                messages_sent: 1,
            }
        );

        counters.subscription_removed();
        counters.subscription_removed();
        counters.connection_closed();
        assert_eq!(counters.active_subscriptions(), 0);
        assert_eq!(counters.open_connections(), 0);
    }

    #[test]
    fn test_global_is_shared() {
        let a = Counters::global();
        let b = Counters::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_wait_helpers() {
        let counters = Arc::new(Counters::new());
        let writer = Arc::clone(&counters);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.subscription_added();
            writer.message_sent();
            writer.message_sent();
        });

        assert!(counters.wait_for_subscription_count(1, Duration::from_secs(2)).await);
        assert!(counters.wait_for_messages_sent(2, Duration::from_secs(2)).await);
        assert!(!counters.wait_for_connection_count(1, Duration::from_millis(50)).await);
    }
}
