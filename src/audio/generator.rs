// Synthetic test-tone source for passthrough audio
//
// A slow pitch LFO sweeps a sine carrier around a base pitch. Both phase
// accumulators persist between chunks, so consecutive chunks join without a
// discontinuity. Each mono sample is fanned out to every channel.

use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

use super::types::AudioFormat;

/// Parameters of the swept test tone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneSettings {
    pub base_pitch_hz: f32,
    pub pitch_deviation_hz: f32,
    pub pitch_lfo_hz: f32,
    pub amplitude: f32,
}

impl Default for ToneSettings {
    fn default() -> Self {
        Self {
            base_pitch_hz: 440.0, // perfect A
            pitch_deviation_hz: 100.0,
            pitch_lfo_hz: 5.0,
            amplitude: i16::MAX as f32,
        }
    }
}

impl ToneSettings {
    /// Highest instantaneous carrier frequency the LFO can reach
    pub fn peak_frequency_hz(&self) -> f32 {
        self.base_pitch_hz + self.pitch_deviation_hz.abs()
    }
}

/// Carrier and pitch-LFO phase accumulators, each kept in `[0, 2π)`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WaveformState {
    carrier_phase: f64,
    pitch_phase: f64,
}

impl WaveformState {
    pub fn carrier_phase(&self) -> f64 {
        self.carrier_phase
    }

    pub fn pitch_phase(&self) -> f64 {
        self.pitch_phase
    }
}

/// Subtract whole turns; never snaps back to zero.
fn wrap_phase(mut phase: f64) -> f64 {
    while phase >= TAU {
        phase -= TAU;
    }
    phase
}

/// One fixed-size block of interleaved 16-bit samples.
///
/// Immutable once produced; submitting it to a sink moves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
    channels: u16,
    sequence: u64,
}

impl AudioChunk {
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Position of this chunk in the generator's output, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Produces one chunk per call from a deterministic swept sine
#[derive(Debug, Clone)]
pub struct AudioChunkGenerator {
    format: AudioFormat,
    tone: ToneSettings,
    state: WaveformState,
    pitch_step: f64,
    chunks_generated: u64,
}

impl AudioChunkGenerator {
    pub fn new(format: AudioFormat, tone: ToneSettings) -> Self {
        let pitch_step = TAU * tone.pitch_lfo_hz as f64 / format.sample_rate as f64;
        Self {
            format,
            tone,
            state: WaveformState::default(),
            pitch_step,
            chunks_generated: 0,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn tone(&self) -> ToneSettings {
        self.tone
    }

    pub fn state(&self) -> WaveformState {
        self.state
    }

    pub fn chunks_generated(&self) -> u64 {
        self.chunks_generated
    }

    /// Generate the next chunk, advancing the waveform state.
    pub fn next_chunk(&mut self) -> AudioChunk {
        let frames = self.format.frames_per_chunk();
        let channels = self.format.channels as usize;
        let sample_rate = self.format.sample_rate as f64;
        let base = self.tone.base_pitch_hz as f64;
        let deviation = self.tone.pitch_deviation_hz as f64;
        let amplitude = self.tone.amplitude as f64;

        let mut samples = Vec::with_capacity(frames * channels);
        for _ in 0..frames {
            let pitch = base + deviation * self.state.pitch_phase.sin();
            let carrier_step = TAU * pitch / sample_rate;
            self.state.carrier_phase = wrap_phase(self.state.carrier_phase + carrier_step);
            self.state.pitch_phase = wrap_phase(self.state.pitch_phase + self.pitch_step);

            let sample = (self.state.carrier_phase.sin() * amplitude).round() as i16;
            samples.extend(std::iter::repeat(sample).take(channels));
        }

        let chunk = AudioChunk {
            samples,
            channels: self.format.channels,
            sequence: self.chunks_generated,
        };
        self.chunks_generated += 1;
        chunk
    }

    /// Restart the waveform from phase zero
    pub fn reset(&mut self) {
        self.state = WaveformState::default();
        self.chunks_generated = 0;
    }
}
