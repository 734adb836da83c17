use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::{
    AudioFormat, ToneSettings, WaitStrategy, DEFAULT_CHANNELS, DEFAULT_CHUNK_DURATION_MS,
    DEFAULT_SAMPLE_RATE,
};

pub const ENV_SAMPLE_RATE: &str = "BEATCAST_SAMPLE_RATE";
pub const ENV_CHANNELS: &str = "BEATCAST_CHANNELS";
pub const ENV_CHUNK_MS: &str = "BEATCAST_CHUNK_MS";
pub const ENV_POLL_MS: &str = "BEATCAST_POLL_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Audio pacing settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_duration_ms: u32,

    /// Test tone
    pub base_pitch_hz: f32,
    pub pitch_deviation_hz: f32,
    pub pitch_lfo_hz: f32,
    pub amplitude: f32,

    pub wait_strategy: WaitStrategy,
}

impl Default for PacingConfig {
    fn default() -> Self {
        let tone = ToneSettings::default();
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_duration_ms: DEFAULT_CHUNK_DURATION_MS,
            base_pitch_hz: tone.base_pitch_hz,
            pitch_deviation_hz: tone.pitch_deviation_hz,
            pitch_lfo_hz: tone.pitch_lfo_hz,
            amplitude: tone.amplitude,
            wait_strategy: WaitStrategy::default(),
        }
    }
}

impl PacingConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.chunk_duration_ms)
    }

    pub fn tone(&self) -> ToneSettings {
        ToneSettings {
            base_pitch_hz: self.base_pitch_hz,
            pitch_deviation_hz: self.pitch_deviation_hz,
            pitch_lfo_hz: self.pitch_lfo_hz,
            amplitude: self.amplitude,
        }
    }
}

/// Control loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub poll_interval_ms: u64,
    /// Bound on waiting for the pacing thread and control task to exit
    pub shutdown_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl ControlConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub pacing: PacingConfig,
    pub control: ControlConfig,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&contents)?;
        info!("🔧 Loaded config from {}", path.display());
        Ok(config)
    }

    /// Override fields from `BEATCAST_*` environment variables. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) -> &mut Self {
        if let Some(rate) = env_value(ENV_SAMPLE_RATE) {
            self.pacing.sample_rate = rate;
        }
        if let Some(channels) = env_value(ENV_CHANNELS) {
            self.pacing.channels = channels;
        }
        if let Some(chunk_ms) = env_value(ENV_CHUNK_MS) {
            self.pacing.chunk_duration_ms = chunk_ms;
        }
        if let Some(poll_ms) = env_value(ENV_POLL_MS) {
            self.control.poll_interval_ms = poll_ms;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pacing = &self.pacing;
        if pacing.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if pacing.channels == 0 {
            return Err(invalid("channels", "must be positive"));
        }
        if pacing.chunk_duration_ms == 0 {
            return Err(invalid("chunk_duration_ms", "must be positive"));
        }
        if !pacing.format().has_whole_frames() {
            return Err(invalid(
                "chunk_duration_ms",
                format!(
                    "{} ms at {} Hz is not a whole number of frames",
                    pacing.chunk_duration_ms, pacing.sample_rate
                ),
            ));
        }

        let nyquist = pacing.sample_rate as f32 / 2.0;
        let peak = pacing.tone().peak_frequency_hz();
        if !(peak < nyquist) || pacing.base_pitch_hz <= 0.0 {
            return Err(invalid(
                "base_pitch_hz",
                format!("peak {} Hz must be positive and below Nyquist ({} Hz)", peak, nyquist),
            ));
        }
        if !(pacing.pitch_lfo_hz >= 0.0) {
            return Err(invalid("pitch_lfo_hz", "must not be negative"));
        }
        if !(pacing.amplitude > 0.0 && pacing.amplitude <= i16::MAX as f32) {
            return Err(invalid(
                "amplitude",
                format!("{} is outside (0, {}]", pacing.amplitude, i16::MAX),
            ));
        }
        if let WaitStrategy::SleepThenSpin { spin_threshold_us } = pacing.wait_strategy {
            if spin_threshold_us >= pacing.chunk_duration_ms as u64 * 1000 {
                return Err(invalid(
                    "wait_strategy",
                    "spin threshold must be shorter than one chunk",
                ));
            }
        }

        if self.control.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("⚠️ Ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}
