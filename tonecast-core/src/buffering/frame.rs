//! Frame and playout format types shared by the bridge and the pump.

use std::time::Duration;

/// Playout format of the telephony leg: 8-bit samples (one byte per sample)
/// at `sample_rate`, emitted in frames of `frame_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples (= bytes) per second. 8000 for G.711.
    pub sample_rate: u32,
    /// Bytes drained from the ring per emission tick.
    pub frame_bytes: usize,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, frame_bytes: usize) -> Self {
        Self {
            sample_rate,
            frame_bytes,
        }
    }

    /// Playback time of `bytes` samples at this sample rate.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = bytes as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Playback time of one full frame.
    pub fn frame_duration(&self) -> Duration {
        self.duration_of(self.frame_bytes)
    }

    /// How long the producer should wait before retrying a write that is
    /// `shortfall` bytes short of free space: the drain time of the missing
    /// bytes plus one frame of slack.
    pub fn backoff_for(&self, shortfall: usize) -> Duration {
        self.duration_of(shortfall) + self.frame_duration()
    }
}

impl Default for AudioFormat {
    /// 20 ms frames of 8 kHz μ-law.
    fn default() -> Self {
        Self::new(8_000, 160)
    }
}

/// One block of audio handed to the channel sink.
///
/// Built fresh on every emission tick; the sink must copy it if it needs the
/// bytes beyond the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    /// Sample count (one byte per sample).
    pub fn samples(&self) -> usize {
        self.data.len()
    }

    pub fn duration(&self) -> Duration {
        AudioFormat::new(self.sample_rate, self.data.len()).frame_duration()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_byte_is_125_micros_at_8khz() {
        let format = AudioFormat::default();
        assert_eq!(format.duration_of(1), Duration::from_micros(125));
        assert_eq!(format.frame_duration(), Duration::from_millis(20));
    }

    #[test]
    fn backoff_adds_one_frame_of_slack() {
        let format = AudioFormat::new(8_000, 20);
        // 100 missing bytes = 12.5 ms, plus 20 bytes of slack = 2.5 ms.
        assert_eq!(format.backoff_for(100), Duration::from_micros(15_000));
    }

    #[test]
    fn frame_duration_follows_its_length() {
        let frame = Frame::new(vec![0xFF; 80], 8_000);
        assert_eq!(frame.samples(), 80);
        assert_eq!(frame.duration(), Duration::from_millis(10));
        assert!(!frame.is_empty());
    }

    #[test]
    fn zero_rate_never_divides() {
        let format = AudioFormat::new(0, 160);
        assert_eq!(format.duration_of(1_000), Duration::ZERO);
    }
}
