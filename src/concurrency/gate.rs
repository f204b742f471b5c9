// src/concurrency/gate.rs

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

/// Admission control for submissions racing a shutdown.
///
/// A submitter registers before checking the closed flag and the closer
/// waits for registered submitters after setting it, so an item is either
/// rejected or visible to the shutdown path, never stranded in between.
#[derive(Debug, Default)]
pub(crate) struct IntakeGate {
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

impl IntakeGate {
    pub(crate) fn enter(&self) -> Option<IntakePermit<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(IntakePermit { gate: self })
    }

    /// Closes the gate; returns `false` if it was already closed
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits for submitters admitted before `close` to finish
    pub(crate) fn wait_drained(&self) {
        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            backoff.snooze();
        }
    }
}

pub(crate) struct IntakePermit<'a> {
    gate: &'a IntakeGate,
}

impl Drop for IntakePermit<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_closed_gate_rejects() {
        let gate = IntakeGate::default();
        assert!(gate.enter().is_some());

        assert!(gate.close());
        assert!(!gate.close());
        assert!(gate.enter().is_none());
        assert!(gate.is_closed());
    }

    #[test]
    fn test_close_waits_for_admitted_submitters() {
        let gate = Arc::new(IntakeGate::default());
        let (admitted_tx, admitted_rx) = std::sync::mpsc::channel();

        let submitter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _permit = gate.enter().unwrap();
                admitted_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            })
        };

        admitted_rx.recv().unwrap();
        gate.close();
        gate.wait_drained();

        assert_eq!(gate.in_flight.load(Ordering::SeqCst), 0);
        submitter.join().unwrap();
    }
}
