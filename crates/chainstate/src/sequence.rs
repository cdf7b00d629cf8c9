//! Versioned reader/writer coordination without a reader-side mutex.
//!
//! The sequence is even while the store is quiescent and odd while a write
//! is in progress. A reader samples the sequence, runs, then re-samples;
//! matching even values certify the snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sleep interval between reader retries.
pub const SPIN_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct SequenceLock {
    sequence: AtomicU64,
}

impl SequenceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_read(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn is_write_locked(sequence: u64) -> bool {
        sequence & 1 == 1
    }

    pub fn is_read_valid(&self, sequence: u64) -> bool {
        self.sequence.load(Ordering::Acquire) == sequence
    }

    pub fn begin_write(&self) {
        let previous = self.sequence.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous & 1 == 0, "nested begin_write");
    }

    pub fn end_write(&self) {
        let previous = self.sequence.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous & 1 == 1, "end_write without begin_write");
    }

    /// Run `reader` under the spin protocol until it observes a consistent
    /// snapshot. The reader must not mutate shared state.
    pub fn read_serial<T>(&self, mut reader: impl FnMut() -> T) -> T {
        loop {
            let sequence = self.begin_read();
            if Self::is_write_locked(sequence) {
                std::thread::sleep(SPIN_SLEEP);
                continue;
            }
            let result = reader();
            if !self.is_read_valid(sequence) {
                std::thread::sleep(SPIN_SLEEP);
                continue;
            }
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn write_toggles_lock_state() {
        let lock = SequenceLock::new();
        let s0 = lock.begin_read();
        assert!(!SequenceLock::is_write_locked(s0));

        lock.begin_write();
        let s1 = lock.begin_read();
        assert!(SequenceLock::is_write_locked(s1));
        assert!(!lock.is_read_valid(s0));

        lock.end_write();
        let s2 = lock.begin_read();
        assert!(!SequenceLock::is_write_locked(s2));
        assert_ne!(s0, s2);
    }

    #[test]
    fn readers_never_observe_torn_writes() {
        let lock = Arc::new(SequenceLock::new());
        let left = Arc::new(AtomicU64::new(0));
        let right = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let lock = Arc::clone(&lock);
            let left = Arc::clone(&left);
            let right = Arc::clone(&right);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for round in 1..=500u64 {
                    lock.begin_write();
                    left.store(round, Ordering::Relaxed);
                    // A reader that lands here would see left != right.
                    right.store(round, Ordering::Relaxed);
                    lock.end_write();
                }
                done.store(true, Ordering::Release);
            })
        };

        let reader = {
            let lock = Arc::clone(&lock);
            let left = Arc::clone(&left);
            let right = Arc::clone(&right);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let (a, b) = lock.read_serial(|| {
                        (left.load(Ordering::Relaxed), right.load(Ordering::Relaxed))
                    });
                    assert_eq!(a, b, "reader observed a torn write");
                }
            })
        };

        writer.join().expect("writer");
        reader.join().expect("reader");
    }
}
