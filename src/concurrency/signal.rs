// src/concurrency/signal.rs

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Manual-reset event shared by all workers of a pool.
///
/// Once set it stays set, releasing every waiter, until a worker that has
/// observed an empty queue resets it.
#[derive(Debug, Default)]
pub struct WakeSignal {
    set: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the signal is set or `timeout` elapses. Returns whether it was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            self.condvar.wait_while_for(&mut set, |set| !*set, timeout);
        }
        *set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_when_unset() {
        let signal = WakeSignal::new();
        let started = Instant::now();

        assert!(!signal.wait(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_stays_set_until_reset() {
        let signal = WakeSignal::new();
        signal.set();

        assert!(signal.wait(Duration::from_millis(1)));
        assert!(signal.wait(Duration::from_millis(1)));

        signal.reset();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_set_releases_all_waiters() {
        let signal = Arc::new(WakeSignal::new());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.wait(Duration::from_secs(5)))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        signal.set();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }
}
