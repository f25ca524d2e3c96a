//! Timeout-bounded peer-to-node affinity.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A sticky binding that stays valid for its timeout after the last reset.
///
/// A zero timeout is never valid, which is how a service with sessions
/// disabled falls through to plain balancing.
pub struct Session {
    timeout: Duration,
    started: Mutex<Instant>,
}

impl Session {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, started: Mutex::new(Instant::now()) }
    }

    pub fn is_valid(&self) -> bool {
        self.time_left() > Duration::ZERO
    }

    /// Restart the timer.
    pub fn reset(&self) {
        *self.started.lock().unwrap() = Instant::now();
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time remaining until the session expires; zero once elapsed.
    pub fn time_left(&self) -> Duration {
        let started = *self.started.lock().unwrap();
        self.timeout.saturating_sub(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_timeout_is_never_valid() {
        let session = Session::new(Duration::ZERO);
        assert!(!session.is_valid());
        session.reset();
        assert!(!session.is_valid());
    }

    #[test]
    fn test_valid_until_timeout_elapses() {
        let session = Session::new(Duration::from_millis(50));
        assert!(session.is_valid());
        thread::sleep(Duration::from_millis(80));
        assert!(!session.is_valid());
        assert_eq!(session.time_left(), Duration::ZERO);
    }

    #[test]
    fn test_reset_restarts_timer() {
        let session = Session::new(Duration::from_millis(100));
        thread::sleep(Duration::from_millis(60));
        session.reset();
        thread::sleep(Duration::from_millis(60));
        // 120ms since creation, but only 60ms since the reset.
        assert!(session.is_valid());
    }

    #[test]
    fn test_time_left_decreases() {
        let session = Session::new(Duration::from_secs(10));
        let first = session.time_left();
        thread::sleep(Duration::from_millis(20));
        let second = session.time_left();
        assert!(second < first);
        assert!(second > Duration::from_secs(9));
    }
}
