//! `LoopbackChannel` — in-memory call leg driven by a clock.
//!
//! Inbound activity is scripted at clock timestamps; every blocking wait
//! sleeps on the injected clock until the next scripted item or the timeout,
//! whichever comes first. With a `ManualClock` a whole call runs in
//! simulated time. Emitted frames, variables and routing decisions are
//! recorded and readable through a `ChannelProbe`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{CallChannel, DigitWait, InboundEvent, WaitOutcome, WriteFormat};
use crate::buffering::frame::Frame;
use crate::clock::ClockHandle;
use crate::error::{Result, TonecastError};

/// Something the far end does at a scripted time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedInbound {
    Event(InboundEvent),
    /// The wait reports ready but the read yields nothing.
    NullFrame,
    Disconnect,
}

impl ScriptedInbound {
    /// DTMF press of `key` ('0'–'9', '*', '#').
    pub fn dtmf(key: char) -> Self {
        ScriptedInbound::Event(InboundEvent::Dtmf(key as u32))
    }
}

/// A frame as the far end received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFrame {
    /// Clock time of the write.
    pub at: Duration,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct ChannelRecord {
    frames: Vec<EmittedFrame>,
    variables: BTreeMap<String, String>,
    variable_sets: Vec<(String, String)>,
    routed_to: Option<String>,
    answered: bool,
    format_history: Vec<WriteFormat>,
}

/// Read-only view of what happened on a `LoopbackChannel`.
#[derive(Debug, Clone)]
pub struct ChannelProbe(Arc<Mutex<ChannelRecord>>);

impl ChannelProbe {
    pub fn frames(&self) -> Vec<EmittedFrame> {
        self.0.lock().frames.clone()
    }

    pub fn frame_times(&self) -> Vec<Duration> {
        self.0.lock().frames.iter().map(|f| f.at).collect()
    }

    /// All audio bytes written, in order.
    pub fn audio(&self) -> Vec<u8> {
        self.0
            .lock()
            .frames
            .iter()
            .flat_map(|f| f.bytes.iter().copied())
            .collect()
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.0.lock().variables.get(name).cloned()
    }

    /// Every `set_variable` call, in order.
    pub fn variable_sets(&self) -> Vec<(String, String)> {
        self.0.lock().variable_sets.clone()
    }

    pub fn routed_to(&self) -> Option<String> {
        self.0.lock().routed_to.clone()
    }

    pub fn answered(&self) -> bool {
        self.0.lock().answered
    }

    /// Every format the session switched to, in order.
    pub fn format_history(&self) -> Vec<WriteFormat> {
        self.0.lock().format_history.clone()
    }
}

struct Scheduled {
    at: Duration,
    what: ScriptedInbound,
}

pub struct LoopbackChannel {
    clock: ClockHandle,
    schedule: VecDeque<Scheduled>,
    /// Event fetched by the last `Ready` wait; inner `None` is a null frame.
    pending: Option<Option<InboundEvent>>,
    up: bool,
    disconnected: bool,
    write_format: WriteFormat,
    extensions: Vec<String>,
    failing_writes: bool,
    format_failure: bool,
    record: Arc<Mutex<ChannelRecord>>,
}

impl LoopbackChannel {
    /// An answered channel currently writing signed linear audio.
    pub fn new(clock: ClockHandle) -> Self {
        Self {
            clock,
            schedule: VecDeque::new(),
            pending: None,
            up: true,
            disconnected: false,
            write_format: WriteFormat::Slin,
            extensions: Vec::new(),
            failing_writes: false,
            format_failure: false,
            record: Arc::new(Mutex::new(ChannelRecord::default())),
        }
    }

    /// Start in the ringing (not yet answered) state.
    pub fn ringing(mut self) -> Self {
        self.up = false;
        self
    }

    pub fn with_variable(self, name: &str, value: &str) -> Self {
        self.record
            .lock()
            .variables
            .insert(name.to_string(), value.to_string());
        self
    }

    /// Register an extension that exists in the current context.
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extensions.push(extension.to_string());
        self
    }

    pub fn with_write_format(mut self, format: WriteFormat) -> Self {
        self.write_format = format;
        self
    }

    /// Every frame write fails.
    pub fn with_failing_writes(mut self) -> Self {
        self.failing_writes = true;
        self
    }

    /// Switching the write format fails.
    pub fn with_format_failure(mut self) -> Self {
        self.format_failure = true;
        self
    }

    /// Script `what` to happen at clock time `at`.
    pub fn at(mut self, at: Duration, what: ScriptedInbound) -> Self {
        let idx = self.schedule.partition_point(|s| s.at <= at);
        self.schedule.insert(idx, Scheduled { at, what });
        self
    }

    pub fn probe(&self) -> ChannelProbe {
        ChannelProbe(Arc::clone(&self.record))
    }

    /// Pop the next scripted item if it happens within `deadline`, sleeping
    /// the clock up to its timestamp.
    fn next_within(&mut self, deadline: Duration) -> Option<ScriptedInbound> {
        let due = self.schedule.front().is_some_and(|s| s.at <= deadline);
        if !due {
            return None;
        }
        let item = self.schedule.pop_front()?;
        let now = self.clock.now();
        self.clock.sleep(item.at.saturating_sub(now));
        Some(item.what)
    }

    fn sleep_until(&self, deadline: Duration) {
        let now = self.clock.now();
        self.clock.sleep(deadline.saturating_sub(now));
    }
}

impl CallChannel for LoopbackChannel {
    fn is_up(&self) -> bool {
        self.up
    }

    fn answer(&mut self) -> Result<()> {
        if self.disconnected {
            return Err(TonecastError::ChannelSetup("channel hung up".into()));
        }
        self.up = true;
        self.record.lock().answered = true;
        Ok(())
    }

    fn set_write_format(&mut self, format: WriteFormat) -> Result<WriteFormat> {
        if self.format_failure {
            return Err(TonecastError::ChannelSetup(format!(
                "unable to set write format {format:?}"
            )));
        }
        let previous = self.write_format;
        self.write_format = format;
        self.record.lock().format_history.push(format);
        Ok(previous)
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.failing_writes {
            return Err(TonecastError::Sink("loopback write rejected".into()));
        }
        if self.disconnected {
            return Err(TonecastError::Sink("channel hung up".into()));
        }
        let at = self.clock.now();
        self.record.lock().frames.push(EmittedFrame {
            at,
            bytes: frame.data.clone(),
        });
        Ok(())
    }

    fn wait_for_event(&mut self, timeout: Duration) -> WaitOutcome {
        if self.disconnected {
            return WaitOutcome::Disconnected;
        }
        if self.pending.is_some() {
            return WaitOutcome::Ready;
        }

        let deadline = self.clock.now() + timeout;
        match self.next_within(deadline) {
            Some(ScriptedInbound::Event(event)) => {
                self.pending = Some(Some(event));
                WaitOutcome::Ready
            }
            Some(ScriptedInbound::NullFrame) => {
                self.pending = Some(None);
                WaitOutcome::Ready
            }
            Some(ScriptedInbound::Disconnect) => {
                self.disconnected = true;
                WaitOutcome::Disconnected
            }
            None => {
                self.sleep_until(deadline);
                WaitOutcome::Timeout
            }
        }
    }

    fn read_event(&mut self) -> Option<InboundEvent> {
        self.pending.take().flatten()
    }

    fn wait_for_digit(&mut self, timeout: Duration) -> DigitWait {
        let deadline = self.clock.now() + timeout;
        loop {
            if self.disconnected {
                return DigitWait::Hangup;
            }
            match self.next_within(deadline) {
                Some(ScriptedInbound::Event(InboundEvent::Dtmf(code))) => {
                    return DigitWait::Digit(code)
                }
                Some(ScriptedInbound::Event(other)) => {
                    debug!(event = ?other, "non-digit event while waiting for digit");
                }
                Some(ScriptedInbound::NullFrame) => return DigitWait::Hangup,
                Some(ScriptedInbound::Disconnect) => {
                    self.disconnected = true;
                    return DigitWait::Hangup;
                }
                None => {
                    self.sleep_until(deadline);
                    return DigitWait::Timeout;
                }
            }
        }
    }

    fn variable(&self, name: &str) -> Option<String> {
        self.record.lock().variables.get(name).cloned()
    }

    fn set_variable(&mut self, name: &str, value: &str) {
        let mut record = self.record.lock();
        record
            .variables
            .insert(name.to_string(), value.to_string());
        record
            .variable_sets
            .push((name.to_string(), value.to_string()));
    }

    fn extension_exists(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }

    fn goto_extension(&mut self, extension: &str) {
        self.record.lock().routed_to = Some(extension.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn wait_times_out_on_the_clock() {
        let clock = ManualClock::shared();
        let mut channel = LoopbackChannel::new(clock.clone());
        assert_eq!(channel.wait_for_event(ms(30)), WaitOutcome::Timeout);
        assert_eq!(clock.now(), ms(30));
    }

    #[test]
    fn scripted_event_wakes_the_wait_at_its_timestamp() {
        let clock = ManualClock::shared();
        let mut channel =
            LoopbackChannel::new(clock.clone()).at(ms(25), ScriptedInbound::dtmf('5'));

        assert_eq!(channel.wait_for_event(ms(20)), WaitOutcome::Timeout);
        assert_eq!(channel.wait_for_event(ms(20)), WaitOutcome::Ready);
        assert_eq!(clock.now(), ms(25));
        assert_eq!(channel.read_event(), Some(InboundEvent::Dtmf('5' as u32)));
        assert_eq!(channel.read_event(), None);
    }

    #[test]
    fn disconnect_is_sticky() {
        let clock = ManualClock::shared();
        let mut channel = LoopbackChannel::new(clock).at(ms(5), ScriptedInbound::Disconnect);
        assert_eq!(channel.wait_for_event(ms(10)), WaitOutcome::Disconnected);
        assert_eq!(channel.wait_for_event(ms(10)), WaitOutcome::Disconnected);
        assert_eq!(channel.wait_for_digit(ms(10)), DigitWait::Hangup);
        assert!(channel.write_frame(&Frame::new(vec![1], 8_000)).is_err());
    }

    #[test]
    fn digit_wait_skips_non_digit_events() {
        let clock = ManualClock::shared();
        let mut channel = LoopbackChannel::new(clock.clone())
            .at(ms(10), ScriptedInbound::Event(InboundEvent::Voice(160)))
            .at(ms(20), ScriptedInbound::dtmf('#'));

        assert_eq!(channel.wait_for_digit(ms(100)), DigitWait::Digit('#' as u32));
        assert_eq!(clock.now(), ms(20));
        assert_eq!(channel.wait_for_digit(ms(100)), DigitWait::Timeout);
        assert_eq!(clock.now(), ms(120));
    }

    #[test]
    fn frames_and_variables_are_recorded() {
        let clock = ManualClock::shared();
        let mut channel = LoopbackChannel::new(clock.clone()).with_variable("SWIFT_VOICE", "Callie");
        let probe = channel.probe();

        clock.advance(ms(7));
        channel.write_frame(&Frame::new(vec![1, 2], 8_000)).unwrap();
        channel.set_variable("SWIFT_DTMF", "42");

        assert_eq!(probe.frame_times(), vec![ms(7)]);
        assert_eq!(probe.audio(), vec![1, 2]);
        assert_eq!(channel.variable("SWIFT_VOICE").as_deref(), Some("Callie"));
        assert_eq!(probe.variable("SWIFT_DTMF").as_deref(), Some("42"));
    }

    #[test]
    fn write_format_swap_returns_previous() {
        let clock = ManualClock::shared();
        let mut channel = LoopbackChannel::new(clock).with_write_format(WriteFormat::Alaw);
        assert_eq!(
            channel.set_write_format(WriteFormat::Ulaw).unwrap(),
            WriteFormat::Alaw
        );
        assert_eq!(
            channel.set_write_format(WriteFormat::Alaw).unwrap(),
            WriteFormat::Ulaw
        );
        assert_eq!(
            channel.probe().format_history(),
            vec![WriteFormat::Ulaw, WriteFormat::Alaw]
        );
    }
}
