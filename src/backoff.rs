//! Exponential backoff with a floor and ceiling, cancellable against a stop
//! signal. Mirrors `newBackoffTimer`/`bt.wait`/`bt.reset`/`bt.currentDelay`
//! used by the tail loop (`file_collector.go`) and the watch loop
//! (`collector.go`).

use std::time::Duration;

use tokio::sync::watch;

pub struct BackoffTimer {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl BackoffTimer {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        BackoffTimer {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Reset the delay back to the floor. Called after any productive read
    /// or a successful reconnect.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// The delay the next `wait` call would sleep for.
    pub fn current_delay(&self) -> Duration {
        self.current
    }

    /// Sleep for the current delay, then double it (capped at `ceiling`).
    /// Resolves early if `stop` fires; in that case the delay is still
    /// advanced so a caller that ignores the early return and calls `wait`
    /// again keeps backing off.
    pub async fn wait(&mut self, stop: &mut watch::Receiver<bool>) {
        let delay = self.current;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {}
        }
        self.current = (self.current * 2).min(self.ceiling);
    }

    /// Sleep for the current delay without any way to cancel early. Used by
    /// the rotation flush, which must not be interrupted by shutdown.
    pub async fn wait_uncancellable(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(self.ceiling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling() {
        let mut bt = BackoffTimer::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(bt.current_delay(), Duration::from_millis(100));
        bt.current = (bt.current * 2).min(bt.ceiling);
        assert_eq!(bt.current_delay(), Duration::from_millis(200));
        for _ in 0..20 {
            bt.current = (bt.current * 2).min(bt.ceiling);
        }
        assert_eq!(bt.current_delay(), Duration::from_secs(10));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut bt = BackoffTimer::new(Duration::from_millis(100), Duration::from_secs(10));
        bt.current = Duration::from_secs(5);
        bt.reset();
        assert_eq!(bt.current_delay(), Duration::from_millis(100));
    }
}
