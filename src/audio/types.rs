use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SAMPLE_RATE: u32 = 44100;
pub const DEFAULT_CHANNELS: u16 = 2;
pub const DEFAULT_CHUNK_DURATION_MS: u32 = 20;

/// Shape of every chunk the pacing engine produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_duration_ms: u32,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, chunk_duration_ms: u32) -> Self {
        Self {
            sample_rate,
            channels,
            chunk_duration_ms,
        }
    }

    /// Sample frames (one sample per channel) in one chunk
    pub fn frames_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_duration_ms as u64 / 1000) as usize
    }

    /// Interleaved samples in one chunk: `channels × sampleRate × chunkDurationMs / 1000`
    pub fn samples_per_chunk(&self) -> usize {
        self.frames_per_chunk() * self.channels as usize
    }

    /// Cadence interval between submissions
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms as u64)
    }

    /// True when a chunk holds a whole number of frames
    pub fn has_whole_frames(&self) -> bool {
        (self.sample_rate as u64 * self.chunk_duration_ms as u64) % 1000 == 0
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, DEFAULT_CHUNK_DURATION_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chunk_size() {
        let format = AudioFormat::default();
        assert_eq!(format.frames_per_chunk(), 882);
        assert_eq!(format.samples_per_chunk(), 1764);
        assert_eq!(format.chunk_interval(), Duration::from_millis(20));
        assert!(format.has_whole_frames());
    }

    #[test]
    fn test_partial_frame_detection() {
        let format = AudioFormat::new(44100, 2, 3);
        assert!(!format.has_whole_frames());
        assert!(AudioFormat::new(48000, 1, 3).has_whole_frames());
    }
}
