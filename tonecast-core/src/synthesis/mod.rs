//! Synthesis engine abstraction and the callback bridge into the ring.
//!
//! Engines push events from their own threads. `SynthesisBridge` is the
//! `SynthesisSink` they push into: it turns audio callbacks into ring writes
//! (blocking for backpressure), and end/error callbacks into the
//! `generating_done` flag.

pub mod scripted;

pub use scripted::{EngineProbe, ScriptStep, ScriptedEngine};

use std::sync::{atomic::Ordering, Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
    buffering::{frame::AudioFormat, RingBuffer},
    error::{Result, TonecastError},
    session::playback::PlaybackDiagnostics,
};

/// Error reported by the engine mid-stream. Not fatal to the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "detail")]
pub enum SynthesisFault {
    /// Every licensed synthesis port is busy.
    PortUnavailable,
    /// Any other engine-side failure.
    Engine(String),
}

impl std::fmt::Display for SynthesisFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthesisFault::PortUnavailable => f.write_str("no synthesis port available"),
            SynthesisFault::Engine(detail) => write!(f, "engine error: {detail}"),
        }
    }
}

/// One callback from the engine. Audio bytes are only valid for the
/// duration of the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisEvent<'a> {
    Audio(&'a [u8]),
    End,
    Error(&'a SynthesisFault),
    /// Event kinds this crate does not know about.
    Unknown(u32),
}

/// Receiver of engine callbacks. Called from engine-owned threads.
pub trait SynthesisSink: Send + Sync {
    fn deliver(&self, event: SynthesisEvent<'_>);
}

/// Contract for text-to-speech backends.
///
/// Engine, port and voice configuration stay behind this trait; the session
/// only sees setup success/failure and the event stream.
pub trait SynthesisEngine: Send {
    /// Open the engine and select `voice`.
    ///
    /// # Errors
    /// `EngineUnavailable` / `VoiceUnavailable`; both are fatal to the call.
    fn open(&mut self, voice: &str) -> Result<()>;

    /// Start synthesizing `text`. Events are delivered to `sink`, possibly
    /// from another thread, ending with exactly one `End` or `Error`.
    ///
    /// # Errors
    /// `SpeakFailed` if the request could not be started.
    fn speak(&mut self, text: &str, sink: Arc<dyn SynthesisSink>) -> Result<()>;

    /// Stop in-flight synthesis immediately. May race with callbacks that
    /// are already running.
    fn stop_now(&mut self) -> Result<()>;

    /// Release everything. Safe to call in any state, including after a
    /// failed `open`.
    fn close(&mut self);
}

/// Adapts engine callbacks into ring buffer mutations.
pub struct SynthesisBridge {
    ring: Arc<RingBuffer>,
    format: AudioFormat,
    diagnostics: Arc<PlaybackDiagnostics>,
    fault: Mutex<Option<SynthesisFault>>,
    internal_fault: Mutex<Option<TonecastError>>,
}

impl SynthesisBridge {
    pub fn new(
        ring: Arc<RingBuffer>,
        format: AudioFormat,
        diagnostics: Arc<PlaybackDiagnostics>,
    ) -> Self {
        Self {
            ring,
            format,
            diagnostics,
            fault: Mutex::new(None),
            internal_fault: Mutex::new(None),
        }
    }

    /// Engine error reported during this session, if any.
    pub fn fault(&self) -> Option<SynthesisFault> {
        self.fault.lock().clone()
    }

    /// Buffer accounting fault hit on the producer side, if any.
    pub fn take_internal_fault(&self) -> Option<TonecastError> {
        self.internal_fault.lock().take()
    }

    fn on_audio(&self, bytes: &[u8]) {
        if self.ring.is_generating_done() {
            self.diagnostics.late_chunks.fetch_add(1, Ordering::Relaxed);
            warn!(
                bytes = bytes.len(),
                "audio callback after end of stream — ignored"
            );
            return;
        }

        debug!(bytes = bytes.len(), "audio callback");
        let format = self.format;
        match self.ring.write(bytes, |shortfall| format.backoff_for(shortfall)) {
            Ok(report) => {
                self.diagnostics
                    .backpressure_waits
                    .fetch_add(report.waits, Ordering::Relaxed);
                self.diagnostics
                    .bytes_queued
                    .fetch_add(report.written, Ordering::Relaxed);
                if report.cancelled {
                    self.diagnostics
                        .chunks_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        bytes = bytes.len(),
                        written = report.written,
                        "playback cancelled — dropping synthesized audio"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "producer hit ring accounting fault");
                let mut slot = self.internal_fault.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
        }
    }

    fn on_fault(&self, fault: &SynthesisFault) {
        match fault {
            SynthesisFault::PortUnavailable => warn!(
                "synthesis error: no ports available for simultaneous synthesis; ending audio early"
            ),
            SynthesisFault::Engine(detail) => {
                warn!(detail = %detail, "synthesis error; ending audio early")
            }
        }
        {
            let mut slot = self.fault.lock();
            if slot.is_none() {
                *slot = Some(fault.clone());
            }
        }
        // No further audio will arrive.
        self.ring.mark_generating_done();
    }
}

impl SynthesisSink for SynthesisBridge {
    fn deliver(&self, event: SynthesisEvent<'_>) {
        match event {
            SynthesisEvent::Audio([]) => debug!("empty audio callback ignored"),
            SynthesisEvent::Audio(bytes) => self.on_audio(bytes),
            SynthesisEvent::End => {
                if self.ring.mark_generating_done() {
                    debug!("end callback; done generating audio");
                } else {
                    warn!("duplicate terminal synthesis event ignored");
                }
            }
            SynthesisEvent::Error(fault) => self.on_fault(fault),
            SynthesisEvent::Unknown(code) => debug!(code, "unknown synthesis event ignored"),
        }
    }
}

impl std::fmt::Debug for SynthesisBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisBridge")
            .field("ring", &self.ring)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::{Duration, Instant};

    fn bridge(capacity: usize) -> (Arc<RingBuffer>, Arc<PlaybackDiagnostics>, SynthesisBridge) {
        let ring = Arc::new(RingBuffer::new(capacity).unwrap());
        let diagnostics = Arc::new(PlaybackDiagnostics::default());
        let bridge = SynthesisBridge::new(
            Arc::clone(&ring),
            AudioFormat::new(8_000, 20),
            Arc::clone(&diagnostics),
        );
        (ring, diagnostics, bridge)
    }

    #[test]
    fn audio_lands_in_ring() {
        let (ring, diagnostics, bridge) = bridge(64);
        bridge.deliver(SynthesisEvent::Audio(&[1, 2, 3]));
        bridge.deliver(SynthesisEvent::Audio(&[]));
        assert_eq!(ring.occupancy(), 3);
        assert_eq!(diagnostics.snapshot().bytes_queued, 3);
    }

    #[test]
    fn end_marks_generation_done() {
        let (ring, _, bridge) = bridge(64);
        bridge.deliver(SynthesisEvent::End);
        assert!(ring.is_generating_done());
        assert!(!ring.is_active());
    }

    #[test]
    fn audio_after_end_is_ignored() {
        let (ring, diagnostics, bridge) = bridge(64);
        bridge.deliver(SynthesisEvent::Audio(&[7; 4]));
        bridge.deliver(SynthesisEvent::End);
        bridge.deliver(SynthesisEvent::Audio(&[8; 4]));

        assert_eq!(ring.occupancy(), 4);
        assert_eq!(diagnostics.snapshot().late_chunks, 1);
    }

    #[test]
    fn port_unavailable_ends_generation_and_is_reported() {
        let (ring, _, bridge) = bridge(64);
        bridge.deliver(SynthesisEvent::Audio(&[1; 10]));
        bridge.deliver(SynthesisEvent::Error(&SynthesisFault::PortUnavailable));

        assert!(ring.is_generating_done());
        assert!(ring.is_active(), "queued audio still plays out");
        assert_eq!(bridge.fault(), Some(SynthesisFault::PortUnavailable));
    }

    #[test]
    fn unknown_events_change_nothing() {
        let (ring, _, bridge) = bridge(64);
        bridge.deliver(SynthesisEvent::Unknown(0x40));
        assert!(!ring.is_generating_done());
        assert_eq!(ring.occupancy(), 0);
        assert!(bridge.fault().is_none());
    }

    #[test]
    fn cancellation_drops_blocked_chunk() {
        let (ring, diagnostics, bridge) = bridge(8);
        let bridge = Arc::new(bridge);
        bridge.deliver(SynthesisEvent::Audio(&[1; 8]));

        let producer = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.deliver(SynthesisEvent::Audio(&[2; 6])))
        };

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        ring.cancel();
        producer.join().expect("producer panicked");

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(ring.occupancy(), 8);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.chunks_dropped, 1);
        assert!(snap.backpressure_waits >= 1);
    }

    #[test]
    fn fault_serializes_with_kind_tag() {
        let json = serde_json::to_value(SynthesisFault::Engine("license expired".into()))
            .expect("serialize fault");
        assert_eq!(json["kind"], "engine");
        assert_eq!(json["detail"], "license expired");

        let json = serde_json::to_value(SynthesisFault::PortUnavailable).expect("serialize");
        assert_eq!(json["kind"], "portUnavailable");
    }
}
