//! Status Ticker
//!
//! Periodic sampler that runs while a session is connected. Each tick
//! hands the measured elapsed interval to a callback; [`StatusTicker::stop`]
//! returns only after the ticker task has exited, so no callback runs
//! once it returns.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Default sampling period
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic tick task with synchronous stop
pub struct StatusTicker {
    period: Duration,
    running: Option<Running>,
}

impl StatusTicker {
    /// Create a stopped ticker
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            running: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start ticking; the first tick fires one period from now.
    ///
    /// Ignored if already running.
    pub fn start<F, Fut>(&mut self, mut on_tick: F)
    where
        F: FnMut(Duration) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.running.is_some() {
            warn!("Status ticker already running");
            return;
        }

        let period = self.period;
        let (stop, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let mut interval = tokio::time::interval_at(start + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = start;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let elapsed = now.duration_since(last);
                        last = now;
                        // Runs to completion even if stop arrives meanwhile
                        on_tick(elapsed).await;
                    }
                }
            }

            debug!("Status ticker stopped");
        });

        debug!("Status ticker started ({:?} period)", period);
        self.running = Some(Running { stop, handle });
    }

    /// Stop and wait for the task to exit, draining an in-flight tick
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.stop.send(());
        if let Err(e) = running.handle.await {
            if e.is_panic() {
                error!("Status ticker panicked: {}", e);
            }
        }
    }
}

impl Default for StatusTicker {
    fn default() -> Self {
        Self::new(TICK_PERIOD)
    }
}

impl Drop for StatusTicker {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_period() {
        let ticks = Arc::new(AtomicU64::new(0));
        let total_ms = Arc::new(AtomicU64::new(0));

        let mut ticker = StatusTicker::default();
        let (t, ms) = (ticks.clone(), total_ms.clone());
        ticker.start(move |elapsed| {
            t.fetch_add(1, Ordering::SeqCst);
            ms.fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
            async {}
        });
        assert!(ticker.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        ticker.stop().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(total_ms.load(Ordering::SeqCst), 3000);
        assert!(!ticker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_after_stop() {
        let ticks = Arc::new(AtomicU64::new(0));
        let mut ticker = StatusTicker::new(Duration::from_millis(100));
        let t = ticks.clone();
        ticker.start(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
            async {}
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        ticker.stop().await;
        let frozen = ticks.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_in_flight_tick() {
        let finished = Arc::new(AtomicU64::new(0));
        let mut ticker = StatusTicker::new(Duration::from_millis(100));
        let f = finished.clone();
        ticker.start(move |_| {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        // First tick at 100ms is mid-sleep at 150ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        ticker.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let mut ticker = StatusTicker::default();
        ticker.stop().await;
        assert!(!ticker.is_running());
    }
}
