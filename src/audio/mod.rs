// Audio module - paced synthetic audio delivery
//
// - clock: monotonic time source and additive deadline schedule
// - types: audio format and chunk geometry
// - generator: continuous two-oscillator test tone, one chunk per call
// - sink: the consumer boundary and a bounded ring-buffer sink
// - pacing: the dedicated pacing thread and its mode flag

pub mod clock;
pub mod generator;
pub mod pacing;
pub mod sink;
pub mod types;

// Re-export commonly used types for easier imports
pub use clock::{MonotonicClock, PacingClock, PacingSchedule};
pub use generator::{AudioChunk, AudioChunkGenerator, ToneSettings, WaveformState};
pub use pacing::{
    AudioPacingLoop, PacingHandle, PacingMode, PacingModeFlag, PacingStats,
    PacingStatsSnapshot, TickOutcome, WaitStrategy,
};
pub use sink::{AudioSink, RingBufferSink, SinkError};
pub use types::{AudioFormat, DEFAULT_CHANNELS, DEFAULT_CHUNK_DURATION_MS, DEFAULT_SAMPLE_RATE};
