//! Lock-guarded circular byte queue between the synthesis callback thread
//! (writer) and the session control thread (reader).
//!
//! Storage is a `ringbuf::HeapRb<u8>` that never leaves the mutex. The byte
//! count, the `generating_done` flag and the `immediate_exit` flag live under
//! the same lock, so every observer sees the buffer and both flags as one
//! consistent unit.
//!
//! The writer blocks on a condvar while the ring is too full. Readers and
//! `cancel()` wake it, and every wait is bounded by a caller-supplied backoff
//! so a lost wakeup can only cost one backoff interval.

pub mod frame;

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ringbuf::{
    traits::{Consumer, Observer, Producer},
    HeapRb,
};
use tracing::{debug, error};

use crate::error::{Result, TonecastError};

/// Default ring capacity in bytes (~8.2 s of 8 kHz μ-law).
pub const DEFAULT_CAPACITY: usize = 65_535;

/// What happened to one `write` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteReport {
    /// Bytes copied into the ring.
    pub written: usize,
    /// Number of bounded waits spent blocked on a full ring.
    pub waits: usize,
    /// `true` if cancellation was observed before all bytes were written.
    pub cancelled: bool,
}

/// Buffer occupancy and both flags, read under one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub occupancy: usize,
    pub generating_done: bool,
    pub immediate_exit: bool,
}

struct RingState {
    storage: HeapRb<u8>,
    /// Bytes queued, tracked independently of the storage and cross-checked
    /// after every mutation.
    count: usize,
    generating_done: bool,
    immediate_exit: bool,
    stop_requested: bool,
}

impl RingState {
    fn verify(&self, capacity: usize) -> Result<()> {
        let actual = self.storage.occupied_len();
        if self.count != actual || self.count > capacity {
            return Err(TonecastError::BufferAccounting {
                expected: self.count,
                actual,
            });
        }
        Ok(())
    }
}

/// Fixed-capacity byte queue plus the session's cancellation state.
pub struct RingBuffer {
    state: Mutex<RingState>,
    /// Signalled when space is freed or cancellation is requested.
    changed: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Allocate a ring of `capacity` bytes.
    ///
    /// # Errors
    /// `TonecastError::InvalidConfig` for a zero capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TonecastError::InvalidConfig(
                "ring capacity must be non-zero".into(),
            ));
        }
        Ok(Self {
            state: Mutex::new(RingState {
                storage: HeapRb::new(capacity),
                count: 0,
                generating_done: false,
                immediate_exit: false,
                stop_requested: false,
            }),
            changed: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `data` into the ring, blocking while there is not enough room.
    ///
    /// `backoff(shortfall)` bounds each wait, where `shortfall` is how many
    /// bytes must drain before the pending piece fits. Data larger than the
    /// whole ring is written in capacity-sized pieces.
    ///
    /// Returns as soon as cancellation is observed; bytes not yet copied are
    /// dropped and `WriteReport::cancelled` is set.
    ///
    /// # Errors
    /// `TonecastError::BufferAccounting` if the storage disagrees with the
    /// byte count. The ring is cancelled before the error is returned.
    pub fn write<F>(&self, data: &[u8], backoff: F) -> Result<WriteReport>
    where
        F: Fn(usize) -> Duration,
    {
        let mut report = WriteReport::default();

        for piece in data.chunks(self.capacity) {
            let mut state = self.state.lock();

            while !state.immediate_exit && state.count + piece.len() > self.capacity {
                let shortfall = state.count + piece.len() - self.capacity;
                let wait = backoff(shortfall);
                report.waits += 1;
                debug!(
                    pending = piece.len(),
                    free = self.capacity - state.count,
                    wait_us = wait.as_micros() as u64,
                    "ring full, producer waiting"
                );
                // Wakeups are re-checked against the loop condition, so a
                // timeout and a notification are handled alike.
                let _ = self.changed.wait_for(&mut state, wait);
            }

            if state.immediate_exit {
                report.cancelled = true;
                return Ok(report);
            }

            let pushed = state.storage.push_slice(piece);
            state.count += pushed;
            if pushed != piece.len() {
                let err = TonecastError::BufferAccounting {
                    expected: state.count + piece.len() - pushed,
                    actual: state.storage.occupied_len(),
                };
                return Err(self.fault(&mut state, err));
            }
            if let Err(e) = state.verify(self.capacity) {
                return Err(self.fault(&mut state, e));
            }
            report.written += pushed;
        }

        Ok(report)
    }

    /// Move up to `buf.len()` queued bytes into `buf`. Never blocks.
    ///
    /// Returns the number of bytes read, which is `min(buf.len(), occupancy)`.
    ///
    /// # Errors
    /// `TonecastError::BufferAccounting` if fewer bytes come out of storage
    /// than the count promised. The ring is cancelled before the error is
    /// returned.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let want = buf.len().min(state.count);
        if want == 0 {
            return Ok(0);
        }

        let popped = state.storage.pop_slice(&mut buf[..want]);
        if popped != want {
            let err = TonecastError::BufferAccounting {
                expected: state.count,
                actual: state.storage.occupied_len() + popped,
            };
            return Err(self.fault(&mut state, err));
        }
        state.count -= popped;
        if let Err(e) = state.verify(self.capacity) {
            return Err(self.fault(&mut state, e));
        }
        drop(state);

        self.changed.notify_all();
        Ok(popped)
    }

    /// Bytes currently queued.
    pub fn occupancy(&self) -> usize {
        self.state.lock().count
    }

    /// Occupancy and both flags from a single lock acquisition.
    pub fn snapshot(&self) -> RingSnapshot {
        let state = self.state.lock();
        RingSnapshot {
            occupancy: state.count,
            generating_done: state.generating_done,
            immediate_exit: state.immediate_exit,
        }
    }

    /// Liveness predicate for the playback loop: not cancelled, and either
    /// synthesis is still running or there is audio left to drain.
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        !state.immediate_exit && (!state.generating_done || state.count > 0)
    }

    /// Request cancellation. Returns `true` only for the call that actually
    /// flipped the flag; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.immediate_exit {
            return false;
        }
        state.immediate_exit = true;
        drop(state);
        self.changed.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().immediate_exit
    }

    /// Record that the producer will deliver no more audio. Returns `false`
    /// if it was already recorded.
    pub fn mark_generating_done(&self) -> bool {
        let mut state = self.state.lock();
        let first = !state.generating_done;
        state.generating_done = true;
        first
    }

    pub fn is_generating_done(&self) -> bool {
        self.state.lock().generating_done
    }

    /// Returns `true` exactly once, the first time it is called while
    /// cancellation is pending and synthesis has not finished. The caller
    /// then owns issuing the engine's stop request.
    pub fn take_stop_request(&self) -> bool {
        let mut state = self.state.lock();
        if state.immediate_exit && !state.generating_done && !state.stop_requested {
            state.stop_requested = true;
            return true;
        }
        false
    }

    fn fault(&self, state: &mut RingState, err: TonecastError) -> TonecastError {
        error!(error = %err, "ring buffer accounting fault — cancelling session");
        state.immediate_exit = true;
        self.changed.notify_all();
        err
    }

    #[cfg(test)]
    pub(crate) fn corrupt_count_for_test(&self, count: usize) {
        self.state.lock().count = count;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("occupancy", &snap.occupancy)
            .field("generating_done", &snap.generating_done)
            .field("immediate_exit", &snap.immediate_exit)
            .finish()
    }
}
