//! Inbound event handling while audio plays.
//!
//! The watcher owns the pump's only blocking wait. A hangup or a null read
//! cancels the ring; a digit press (when collection is configured) cancels
//! the ring and hands the first digit back so the session can stop the
//! engine before the remaining digits are collected.

use std::time::Duration;

use tracing::{debug, info};

use super::digits::{translate_digit, Collected, DigitCollector};
use crate::{
    buffering::RingBuffer,
    config::SessionConfig,
    telephony::{CallChannel, InboundEvent, WaitOutcome, DTMF_VARIABLE},
};

/// What one bounded wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Timeout, or an event that does not concern playback.
    None,
    Hangup,
    /// First digit of a collection; the ring is already cancelled.
    Digit(u32),
}

#[derive(Debug, Clone, Copy)]
struct DigitPolicy {
    timeout: Duration,
    limit: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptWatcher {
    digits: Option<DigitPolicy>,
}

impl InterruptWatcher {
    pub fn new(config: &SessionConfig) -> Self {
        let digits = config.dtmf_enabled().then(|| DigitPolicy {
            timeout: config.dtmf_timeout(),
            limit: config.digit_limit(),
        });
        Self { digits }
    }

    /// Watches for hangups only; digits are discarded like any other event.
    pub fn disabled() -> Self {
        Self { digits: None }
    }

    pub fn collects_digits(&self) -> bool {
        self.digits.is_some()
    }

    /// Wait up to `timeout` for channel activity and react to it.
    pub fn poll(&self, channel: &mut dyn CallChannel, timeout: Duration, ring: &RingBuffer) -> Interrupt {
        match channel.wait_for_event(timeout) {
            WaitOutcome::Timeout => Interrupt::None,
            WaitOutcome::Disconnected => {
                debug!("hangup detected");
                ring.cancel();
                Interrupt::Hangup
            }
            WaitOutcome::Ready => match channel.read_event() {
                None => {
                    debug!("null frame, treating as hangup");
                    ring.cancel();
                    Interrupt::Hangup
                }
                Some(InboundEvent::Dtmf(code)) if self.digits.is_some() => {
                    debug!(code, "digit pressed during playback");
                    ring.cancel();
                    Interrupt::Digit(code)
                }
                Some(other) => {
                    debug!(event = ?other, "inbound event discarded");
                    Interrupt::None
                }
            },
        }
    }

    /// Collect the digits that follow `first` and publish the full string.
    ///
    /// Returns `None` when digit collection is not configured.
    pub fn finish_interrupted(&self, channel: &mut dyn CallChannel, first: u32) -> Option<Collected> {
        let policy = self.digits?;

        let mut collected = Collected {
            presses: 1,
            ..Collected::default()
        };
        match translate_digit(first) {
            Some(key) => collected.digits.push(key),
            None => debug!(code = first, "unmapped first digit omitted"),
        }

        if policy.limit > 1 {
            let rest = DigitCollector::new(policy.timeout, policy.limit - 1).collect(channel);
            collected.digits.push_str(&rest.digits);
            collected.presses += rest.presses;
            collected.hangup = rest.hangup;
        }

        publish(channel, &collected.digits);
        Some(collected)
    }

    /// Collect digits after playback ended on its own, and publish them
    /// (possibly empty).
    ///
    /// Returns `None` when digit collection is not configured.
    pub fn collect_after_playback(&self, channel: &mut dyn CallChannel) -> Option<Collected> {
        let policy = self.digits?;
        let collected = DigitCollector::new(policy.timeout, policy.limit).collect(channel);
        publish(channel, &collected.digits);
        Some(collected)
    }
}

fn publish(channel: &mut dyn CallChannel, digits: &str) {
    info!(digits, "DTMF collected");
    channel.set_variable(DTMF_VARIABLE, digits);
}
