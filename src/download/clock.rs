//! Time source used for retry backoff.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

/// Sleeps between retry attempts.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Real time, backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and records every requested delay.
#[derive(Debug, Default)]
pub struct FakeClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in call order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|sleeps| sleeps.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Clock for FakeClock {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_clock_records_without_waiting() {
        let clock = FakeClock::new();
        let started = std::time::Instant::now();
        clock.sleep(Duration::from_secs(3600)).await;
        clock.sleep(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            clock.sleeps(),
            [Duration::from_secs(3600), Duration::from_secs(2)]
        );
    }
}
