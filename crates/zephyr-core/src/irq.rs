//! Attention-signal coalescing.
//!
//! The controller asserts attention whenever it has a frame. Triggers that
//! arrive while a read pass is running only bump a pending counter; the
//! thread already reading picks them up, so at most one thread touches the
//! transport at a time. Closing the gate also ends a running pass after its
//! current read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

#[derive(Debug, Default)]
pub struct AttentionGate {
    pending: Mutex<usize>,
    ready: AtomicBool,
}

impl AttentionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or close the gate. Triggers on a closed gate are dropped.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Reads requested but not yet completed.
    pub fn pending(&self) -> usize {
        *self.lock()
    }

    /// Handle one attention trigger.
    ///
    /// Runs `read` once per outstanding trigger if no other thread is
    /// reading, and returns the number of passes this call ran.
    pub fn trigger(&self, mut read: impl FnMut()) -> usize {
        if !self.is_ready() {
            trace!("Attention before bring-up finished, dropped");
            return 0;
        }

        {
            let mut pending = self.lock();
            *pending += 1;
            if *pending > 1 {
                trace!(pending = *pending, "Attention coalesced into running pass");
                return 0;
            }
        }

        let mut passes = 0;
        loop {
            read();
            passes += 1;

            let mut pending = self.lock();
            *pending -= 1;
            if *pending == 0 {
                break;
            }
            if !self.is_ready() {
                trace!(dropped = *pending, "Gate closed during pass, dropping queued attention");
                *pending = 0;
                break;
            }
        }
        passes
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_closed_gate_drops_triggers() {
        let gate = AttentionGate::new();
        let mut reads = 0;
        assert_eq!(gate.trigger(|| reads += 1), 0);
        assert_eq!(reads, 0);
        assert_eq!(gate.pending(), 0);

        gate.set_ready(true);
        assert_eq!(gate.trigger(|| reads += 1), 1);
        assert_eq!(reads, 1);
    }

    #[test]
    fn test_concurrent_triggers_are_serialized() {
        let gate = Arc::new(AttentionGate::new());
        gate.set_ready(true);
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let active = Arc::clone(&active);
                let overlap = Arc::clone(&overlap);
                thread::spawn(move || {
                    gate.trigger(|| {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.store(true, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(2));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        let passes: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(passes, 8);
        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(gate.pending(), 0);
    }

    #[test]
    fn test_closing_gate_stops_running_pass() {
        let gate = Arc::new(AttentionGate::new());
        gate.set_ready(true);
        let reads = Arc::new(AtomicUsize::new(0));

        let reader = {
            let gate = Arc::clone(&gate);
            let reads = Arc::clone(&reads);
            thread::spawn(move || {
                gate.trigger(|| {
                    reads.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                })
            })
        };
        while gate.pending() == 0 {
            thread::yield_now();
        }
        for _ in 0..3 {
            assert_eq!(gate.trigger(|| unreachable!()), 0);
        }
        gate.set_ready(false);

        assert_eq!(reader.join().unwrap(), 1);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(gate.pending(), 0);
    }
}
