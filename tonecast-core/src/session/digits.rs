//! DTMF translation and the blocking digit collection loop.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    config::MAX_DIGITS_CAP,
    telephony::{CallChannel, DigitWait},
};

/// Raw channel digit codes and the characters they stand for.
const DTMF_TABLE: [(u32, char); 12] = [
    (35, '#'),
    (42, '*'),
    (48, '0'),
    (49, '1'),
    (50, '2'),
    (51, '3'),
    (52, '4'),
    (53, '5'),
    (54, '6'),
    (55, '7'),
    (56, '8'),
    (57, '9'),
];

/// Map a raw digit code to its key. `None` for codes outside the table,
/// which is distinct from "no digit was pressed".
pub fn translate_digit(code: u32) -> Option<char> {
    DTMF_TABLE
        .iter()
        .find(|(raw, _)| *raw == code)
        .map(|(_, key)| *key)
}

/// What a collection run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    /// Translated keys, in press order. Unmapped codes are left out.
    pub digits: String,
    /// Digit events consumed, including unmapped ones.
    pub presses: usize,
    /// The far end hung up while we were waiting.
    pub hangup: bool,
}

/// Reads up to `limit` digits, each with its own `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct DigitCollector {
    timeout: Duration,
    limit: usize,
}

impl DigitCollector {
    pub fn new(timeout: Duration, limit: usize) -> Self {
        Self {
            timeout,
            limit: limit.min(MAX_DIGITS_CAP),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Block on the channel until `limit` digits were pressed, a wait times
    /// out, or the caller hangs up.
    pub fn collect(&self, channel: &mut dyn CallChannel) -> Collected {
        let mut collected = Collected::default();

        while collected.presses < self.limit {
            match channel.wait_for_digit(self.timeout) {
                DigitWait::Digit(code) => {
                    collected.presses += 1;
                    match translate_digit(code) {
                        Some(key) => {
                            debug!(key = %key, "digit collected");
                            collected.digits.push(key);
                        }
                        None => warn!(code, "unmapped digit code skipped"),
                    }
                }
                DigitWait::Timeout => {
                    debug!(
                        collected = collected.presses,
                        "digit wait timed out"
                    );
                    break;
                }
                DigitWait::Hangup => {
                    debug!("hangup during digit collection");
                    collected.hangup = true;
                    break;
                }
            }
        }

        collected
    }
}
