//! # tonecast-core
//!
//! Streams synthesized speech into a real-time telephony channel while
//! listening for hangups and DTMF digits.
//!
//! ## Architecture
//!
//! ```text
//! SynthesisEngine ──callback thread──► SynthesisBridge ──► RingBuffer
//!                                                            │
//!                               PlaybackPump (paced by Clock) ◄┘
//!                                   │               ▲
//!                        CallChannel::write_frame   │ InterruptWatcher
//!                                                   │  (hangup / DTMF)
//!                                             DigitCollector
//! ```
//!
//! One `Session` per call. The ring, its byte count and both session flags
//! share a single lock; the producer blocks on a condvar when the ring is
//! full and is released by reads or cancellation.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod synthesis;
pub mod telephony;

// Convenience re-exports for downstream crates
pub use buffering::{frame::AudioFormat, frame::Frame, RingBuffer};
pub use clock::{Clock, ClockHandle, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use error::{Result, TonecastError};
pub use events::{CallResult, SessionOutcome, SessionStatus, SessionStatusEvent};
pub use session::{playback::DiagnosticsSnapshot, Session};
pub use synthesis::{
    ScriptStep, ScriptedEngine, SynthesisEngine, SynthesisEvent, SynthesisFault, SynthesisSink,
};
pub use telephony::{CallChannel, LoopbackChannel, ScriptedInbound, WriteFormat};
