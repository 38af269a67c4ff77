//! Telephony channel abstraction.
//!
//! The session treats the call leg as a frame sink plus an event source with
//! blocking wait-with-timeout semantics. Codec negotiation, answering and
//! dialplan lookups are the channel's business; the session only drives them.

pub mod loopback;

pub use loopback::{ChannelProbe, LoopbackChannel, ScriptedInbound};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffering::frame::Frame;
use crate::error::Result;

/// Channel variable that receives the collected digit string.
pub const DTMF_VARIABLE: &str = "SWIFT_DTMF";

/// Channel variable that overrides the configured voice for one call.
pub const VOICE_VARIABLE: &str = "SWIFT_VOICE";

/// Outbound audio encoding of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteFormat {
    /// G.711 μ-law, 8 kHz, one byte per sample.
    Ulaw,
    /// G.711 A-law, 8 kHz, one byte per sample.
    Alaw,
    /// Signed linear 16-bit, 8 kHz.
    Slin,
}

/// Result of a bounded wait for channel activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// An event is pending; fetch it with `read_event`.
    Ready,
    /// Nothing arrived before the timeout.
    Timeout,
    /// The far end went away.
    Disconnected,
}

/// Result of a bounded wait for a single DTMF digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitWait {
    /// Raw digit code as reported by the channel (ASCII of the key).
    Digit(u32),
    Timeout,
    Hangup,
}

/// Inbound frame read from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Raw DTMF code (ASCII of the key).
    Dtmf(u32),
    /// Caller audio; ignored during playback.
    Voice(usize),
    /// Any other control/signalling frame.
    Control(String),
}

/// Contract for the call leg the session plays into.
pub trait CallChannel {
    /// Whether the call has been answered.
    fn is_up(&self) -> bool;

    fn answer(&mut self) -> Result<()>;

    /// Switch the outbound encoding, returning the previous one so it can be
    /// restored during teardown.
    fn set_write_format(&mut self, format: WriteFormat) -> Result<WriteFormat>;

    /// Queue one frame for real-time playback.
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Block until an inbound event is ready, `timeout` elapses, or the far
    /// end disconnects.
    fn wait_for_event(&mut self, timeout: Duration) -> WaitOutcome;

    /// Take the pending event after `WaitOutcome::Ready`. `None` means the
    /// channel produced a null frame, which callers treat as a hangup.
    fn read_event(&mut self) -> Option<InboundEvent>;

    /// Block for one DTMF digit.
    fn wait_for_digit(&mut self, timeout: Duration) -> DigitWait;

    fn variable(&self, name: &str) -> Option<String>;

    fn set_variable(&mut self, name: &str, value: &str);

    /// Whether `extension` exists in the channel's current dialplan context.
    fn extension_exists(&self, extension: &str) -> bool;

    /// Continue the call at `extension`, first priority.
    fn goto_extension(&mut self, extension: &str);
}
