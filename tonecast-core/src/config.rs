//! Per-session configuration.

use std::time::Duration;

use crate::{
    buffering::{frame::AudioFormat, DEFAULT_CAPACITY},
    error::{Result, TonecastError},
};

/// Hard upper bound on collected digits, whatever `max_digits` says.
pub const MAX_DIGITS_CAP: usize = 20;

/// Immutable configuration for one call.
///
/// Read once per session; a per-call voice override never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Ring capacity in bytes. Default: 65535.
    pub buffer_size: usize,
    /// Voice requested from the engine unless the channel overrides it.
    pub voice: String,
    /// Route the call to an extension named by the collected digits.
    pub goto_extension: bool,
    /// Per-digit wait during collection, in milliseconds. 0 disables DTMF.
    pub dtmf_timeout_ms: u64,
    /// Digits to collect. 0 disables DTMF.
    pub max_digits: usize,
    /// Samples per second; one byte per sample. Default: 8000.
    pub sample_rate: u32,
    /// Bytes per emitted frame. Default: 160 (20 ms at 8 kHz).
    pub frame_bytes: usize,
    /// Delay before the first frame so synthesis gets a head start.
    pub startup_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CAPACITY,
            voice: "Allison-8kHz".into(),
            goto_extension: false,
            dtmf_timeout_ms: 0,
            max_digits: 0,
            sample_rate: 8_000,
            frame_bytes: 160,
            startup_delay_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Check the values the ring and pump depend on.
    ///
    /// # Errors
    /// `TonecastError::InvalidConfig` describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(TonecastError::InvalidConfig(
                "buffer_size must be non-zero".into(),
            ));
        }
        if self.sample_rate == 0 {
            return Err(TonecastError::InvalidConfig(
                "sample_rate must be non-zero".into(),
            ));
        }
        if self.frame_bytes == 0 {
            return Err(TonecastError::InvalidConfig(
                "frame_bytes must be non-zero".into(),
            ));
        }
        if self.buffer_size < self.frame_bytes {
            return Err(TonecastError::InvalidConfig(format!(
                "buffer_size ({}) is smaller than one frame ({})",
                self.buffer_size, self.frame_bytes
            )));
        }
        Ok(())
    }

    /// Digit collection is enabled only when both the timeout and the count
    /// are positive.
    pub fn dtmf_enabled(&self) -> bool {
        self.dtmf_timeout_ms > 0 && self.max_digits > 0
    }

    /// `max_digits` clamped to `MAX_DIGITS_CAP`.
    pub fn digit_limit(&self) -> usize {
        self.max_digits.min(MAX_DIGITS_CAP)
    }

    pub fn dtmf_timeout(&self) -> Duration {
        Duration::from_millis(self.dtmf_timeout_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.frame_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_dtmf_off() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert!(!config.dtmf_enabled());
        assert_eq!(config.audio_format().frame_duration(), Duration::from_millis(20));
    }

    #[test]
    fn dtmf_needs_timeout_and_count() {
        let mut config = SessionConfig {
            dtmf_timeout_ms: 3_000,
            ..SessionConfig::default()
        };
        assert!(!config.dtmf_enabled());
        config.max_digits = 4;
        assert!(config.dtmf_enabled());
    }

    #[test]
    fn digit_limit_is_capped() {
        let config = SessionConfig {
            max_digits: 64,
            ..SessionConfig::default()
        };
        assert_eq!(config.digit_limit(), MAX_DIGITS_CAP);
    }

    #[test]
    fn buffer_smaller_than_a_frame_is_rejected() {
        let config = SessionConfig {
            buffer_size: 100,
            frame_bytes: 160,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TonecastError::InvalidConfig(msg)) if msg.contains("smaller than one frame")
        ));
    }

    #[test]
    fn zero_rate_is_rejected() {
        let config = SessionConfig {
            sample_rate: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
