//! Real-time playback pump.
//!
//! ## Per iteration
//!
//! ```text
//! 1. remaining = deadline − now
//! 2. remaining ≤ 0:
//!      occupancy > 0 → read min(frame, occupancy), emit, deadline += duration(bytes)
//!      occupancy = 0 → underrun, deadline += duration(frame / 2), emit nothing
//! 3. remaining > 0:
//!      InterruptWatcher waits on the channel for at most `remaining`
//! 4. cancellation pending and synthesis still running → stop the engine (once)
//! ```
//!
//! The loop runs until the ring reports inactive: cancelled, or synthesis
//! finished and every queued byte has been emitted. Pacing follows the
//! sample rate of the emitted bytes, never the rate at which they arrive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::interrupt::{Interrupt, InterruptWatcher};
use crate::{
    buffering::{
        frame::{AudioFormat, Frame},
        RingBuffer,
    },
    clock::Clock,
    error::Result,
    synthesis::SynthesisEngine,
    telephony::CallChannel,
};

/// Counters shared by the pump (consumer side) and the bridge (producer
/// side). Relaxed atomics; they never synchronise anything.
#[derive(Debug, Default)]
pub struct PlaybackDiagnostics {
    pub frames_emitted: AtomicUsize,
    pub bytes_emitted: AtomicUsize,
    pub underruns: AtomicUsize,
    pub sink_errors: AtomicUsize,
    pub backpressure_waits: AtomicUsize,
    pub bytes_queued: AtomicUsize,
    pub chunks_dropped: AtomicUsize,
    pub late_chunks: AtomicUsize,
    pub stop_requests: AtomicUsize,
}

impl PlaybackDiagnostics {
    pub fn reset(&self) {
        self.frames_emitted.store(0, Ordering::Relaxed);
        self.bytes_emitted.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.sink_errors.store(0, Ordering::Relaxed);
        self.backpressure_waits.store(0, Ordering::Relaxed);
        self.bytes_queued.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.late_chunks.store(0, Ordering::Relaxed);
        self.stop_requests.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            bytes_queued: self.bytes_queued.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            late_chunks: self.late_chunks.load(Ordering::Relaxed),
            stop_requests: self.stop_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_emitted: usize,
    pub bytes_emitted: usize,
    pub underruns: usize,
    pub sink_errors: usize,
    pub backpressure_waits: usize,
    pub bytes_queued: usize,
    pub chunks_dropped: usize,
    pub late_chunks: usize,
    pub stop_requests: usize,
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Synthesis finished and the ring drained (or the ring was cancelled
    /// from the producer side).
    Drained,
    /// The far end hung up.
    Hangup,
    /// A digit interrupted playback; carries its raw code.
    Digit(u32),
}

/// The consumer half of a session.
pub struct PlaybackPump<'a> {
    ring: &'a RingBuffer,
    format: AudioFormat,
    clock: &'a dyn Clock,
    diagnostics: &'a PlaybackDiagnostics,
    startup_delay: Duration,
}

impl<'a> PlaybackPump<'a> {
    pub fn new(
        ring: &'a RingBuffer,
        format: AudioFormat,
        clock: &'a dyn Clock,
        diagnostics: &'a PlaybackDiagnostics,
        startup_delay: Duration,
    ) -> Self {
        Self {
            ring,
            format,
            clock,
            diagnostics,
            startup_delay,
        }
    }

    /// Pace queued audio into `channel` until the ring goes inactive.
    ///
    /// # Errors
    /// Only `TonecastError::BufferAccounting` from the ring. Sink failures
    /// are counted and logged; playback continues.
    pub fn run(
        &self,
        channel: &mut dyn CallChannel,
        engine: &mut dyn SynthesisEngine,
        watcher: &InterruptWatcher,
    ) -> Result<PumpExit> {
        let mut exit = PumpExit::Drained;
        let mut deadline = self.clock.now() + self.startup_delay;
        let mut scratch = vec![0u8; self.format.frame_bytes];
        let starved_advance = self.format.duration_of((self.format.frame_bytes / 2).max(1));

        while self.ring.is_active() {
            let now = self.clock.now();

            if now >= deadline {
                let n = self.ring.read(&mut scratch)?;
                if n > 0 {
                    self.emit(channel, &scratch[..n]);
                    deadline += self.format.duration_of(n);
                } else {
                    self.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);
                    debug!("writer starved for audio");
                    deadline += starved_advance;
                }
            } else {
                match watcher.poll(channel, deadline - now, self.ring) {
                    Interrupt::None => {}
                    Interrupt::Hangup => exit = PumpExit::Hangup,
                    Interrupt::Digit(code) => exit = PumpExit::Digit(code),
                }
            }

            self.stop_engine_if_cancelled(engine);
        }

        Ok(exit)
    }

    fn emit(&self, channel: &mut dyn CallChannel, bytes: &[u8]) {
        let frame = Frame::new(bytes.to_vec(), self.format.sample_rate);
        match channel.write_frame(&frame) {
            Ok(()) => {
                self.diagnostics
                    .frames_emitted
                    .fetch_add(1, Ordering::Relaxed);
                self.diagnostics
                    .bytes_emitted
                    .fetch_add(bytes.len(), Ordering::Relaxed);
                debug!(bytes = bytes.len(), "wrote a frame");
            }
            Err(e) => {
                self.diagnostics.sink_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = bytes.len(), "frame write failed");
            }
        }
    }

    fn stop_engine_if_cancelled(&self, engine: &mut dyn SynthesisEngine) {
        if !self.ring.take_stop_request() {
            return;
        }
        self.diagnostics
            .stop_requests
            .fetch_add(1, Ordering::Relaxed);
        match engine.stop_now() {
            Ok(()) => debug!("synthesis stop requested"),
            Err(e) => warn!(error = %e, "early stop of synthesis failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::ManualClock;
    use crate::synthesis::ScriptedEngine;
    use crate::telephony::{LoopbackChannel, ScriptedInbound};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn filled_ring(capacity: usize, bytes: usize, done: bool) -> RingBuffer {
        let ring = RingBuffer::new(capacity).unwrap();
        let data: Vec<u8> = (0..bytes).map(|i| i as u8).collect();
        ring.write(&data, |_| ms(1)).unwrap();
        if done {
            ring.mark_generating_done();
        }
        ring
    }

    #[test]
    fn frames_follow_sample_rate() {
        let clock = ManualClock::shared();
        let ring = filled_ring(1_000, 800, true);
        let diagnostics = PlaybackDiagnostics::default();
        let mut channel = LoopbackChannel::new(clock.clone());
        let probe = channel.probe();
        let mut engine = ScriptedEngine::new(vec![]);
        let watcher = InterruptWatcher::disabled();

        let pump = PlaybackPump::new(
            &ring,
            AudioFormat::default(),
            clock.as_ref(),
            &diagnostics,
            ms(100),
        );
        let exit = pump.run(&mut channel, &mut engine, &watcher).unwrap();

        assert_eq!(exit, PumpExit::Drained);
        assert_eq!(
            probe.frame_times(),
            vec![ms(100), ms(120), ms(140), ms(160), ms(180)]
        );
        assert_eq!(probe.audio().len(), 800);
        assert_eq!(diagnostics.snapshot().frames_emitted, 5);
        assert_eq!(diagnostics.snapshot().underruns, 0);
    }

    #[test]
    fn short_tail_frame_advances_by_its_own_duration() {
        let clock = ManualClock::shared();
        let ring = filled_ring(1_000, 200, true);
        let diagnostics = PlaybackDiagnostics::default();
        let mut channel = LoopbackChannel::new(clock.clone());
        let probe = channel.probe();
        let mut engine = ScriptedEngine::new(vec![]);

        PlaybackPump::new(&ring, AudioFormat::default(), clock.as_ref(), &diagnostics, ms(0))
            .run(&mut channel, &mut engine, &InterruptWatcher::disabled())
            .unwrap();

        let frames = probe.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].bytes.len(), 40);
        assert_eq!(frames[1].at, ms(20));
    }

    #[test]
    fn underrun_emits_nothing_and_keeps_looping() {
        let clock = ManualClock::shared();
        let ring = RingBuffer::new(1_000).unwrap();
        let diagnostics = PlaybackDiagnostics::default();
        let mut channel =
            LoopbackChannel::new(clock.clone()).at(ms(200), ScriptedInbound::Disconnect);
        let probe = channel.probe();
        let mut engine = ScriptedEngine::new(vec![]);
        let engine_probe = engine.probe();

        let exit = PlaybackPump::new(
            &ring,
            AudioFormat::default(),
            clock.as_ref(),
            &diagnostics,
            ms(100),
        )
        .run(&mut channel, &mut engine, &InterruptWatcher::disabled())
        .unwrap();

        assert_eq!(exit, PumpExit::Hangup);
        assert!(probe.frames().is_empty());
        let snap = diagnostics.snapshot();
        assert_eq!(snap.underruns, 10);
        assert_eq!(snap.stop_requests, 1);
        assert_eq!(engine_probe.stop_requests(), 1);
        assert!(!ring.is_active());
    }

    #[test]
    fn sink_failure_does_not_stop_playback() {
        let clock = ManualClock::shared();
        let ring = filled_ring(1_000, 480, true);
        let diagnostics = PlaybackDiagnostics::default();
        let mut channel = LoopbackChannel::new(clock.clone()).with_failing_writes();
        let mut engine = ScriptedEngine::new(vec![]);

        let exit = PlaybackPump::new(
            &ring,
            AudioFormat::default(),
            clock.as_ref(),
            &diagnostics,
            ms(0),
        )
        .run(&mut channel, &mut engine, &InterruptWatcher::disabled())
        .unwrap();

        assert_eq!(exit, PumpExit::Drained);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.sink_errors, 3);
        assert_eq!(snap.frames_emitted, 0);
        assert_eq!(ring.occupancy(), 0);
        assert_eq!(clock.now(), ms(40));
    }

    #[test]
    fn failed_stop_is_only_logged() {
        let clock = ManualClock::shared();
        let ring = RingBuffer::new(1_000).unwrap();
        let diagnostics = PlaybackDiagnostics::default();
        let mut channel = LoopbackChannel::new(clock.clone()).at(ms(5), ScriptedInbound::Disconnect);
        let mut engine = ScriptedEngine::new(vec![]).with_failing_stop();

        let exit = PlaybackPump::new(
            &ring,
            AudioFormat::default(),
            clock.as_ref(),
            &diagnostics,
            ms(100),
        )
        .run(&mut channel, &mut engine, &InterruptWatcher::disabled())
        .unwrap();

        assert_eq!(exit, PumpExit::Hangup);
        assert_eq!(diagnostics.snapshot().stop_requests, 1);
    }

    #[test]
    fn accounting_fault_aborts_the_pump() {
        let clock = ManualClock::shared();
        let ring = filled_ring(100, 10, false);
        ring.corrupt_count_for_test(40);
        let diagnostics = PlaybackDiagnostics::default();
        let mut channel = LoopbackChannel::new(clock.clone());
        let mut engine = ScriptedEngine::new(vec![]);

        let err = PlaybackPump::new(
            &ring,
            AudioFormat::new(8_000, 20),
            clock.as_ref(),
            &diagnostics,
            ms(0),
        )
        .run(&mut channel, &mut engine, &InterruptWatcher::disabled())
        .unwrap_err();

        assert!(err.is_internal_fault());
        assert!(!ring.is_active());
    }
}
