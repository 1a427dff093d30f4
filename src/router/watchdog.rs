//! Per-seat dead-man's switch

use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::sleep;

/// One pending reset timer per seat, cancel-and-replace on every kick
pub struct Watchdog {
    timeout: Duration,
    timers: DashMap<u32, AbortHandle>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restart the timer for `seat`; `on_expire` runs if nothing kicks it again
    /// within the timeout.
    pub fn kick<F>(&self, seat: u32, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            sleep(timeout).await;
            on_expire();
        });

        if let Some(previous) = self.timers.insert(seat, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Drop the pending timer for `seat` without firing it
    pub fn cancel(&self, seat: u32) {
        if let Some((_, timer)) = self.timers.remove(&seat) {
            timer.abort();
        }
    }

    pub fn cancel_all(&self) {
        self.timers.iter().for_each(|timer| timer.value().abort());
        self.timers.clear();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        (fired, move || {
            let f = f.clone();
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_timeout() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let (fired, on_expire) = counter();

        watchdog.kick(0, on_expire());
        sleep(Duration::from_millis(4900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kick_replaces_pending_timer() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let (fired, on_expire) = counter();

        watchdog.kick(0, on_expire());
        sleep(Duration::from_secs(3)).await;
        watchdog.kick(0, on_expire());
        sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let (fired, on_expire) = counter();

        watchdog.kick(1, on_expire());
        watchdog.cancel(1);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
