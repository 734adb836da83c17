use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use super::engine::EngineError;
use super::ingest::IngestError;

pub const MIN_BITRATE_KBPS: u32 = 230;
pub const MAX_BITRATE_KBPS: u32 = 3500;
pub const MAX_FPS: u32 = 60;
pub const MAX_WIDTH: u32 = 1920;
pub const MAX_HEIGHT: u32 = 1200;
pub const DEFAULT_BITS_PER_PIXEL: f32 = 0.1;
/// Increment used by the volume up/down commands
pub const VOLUME_STEP: f32 = 0.1;

/// Broadcast lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BroadcastState {
    Uninitialized,
    ReadyToBroadcast,
    Broadcasting,
    Paused,
    IngestTesting,
}

impl BroadcastState {
    /// Legal lifecycle edges. Shutdown reaches `Uninitialized` from anywhere.
    pub fn can_transition_to(self, next: BroadcastState) -> bool {
        use BroadcastState::*;
        match (self, next) {
            (Uninitialized, Uninitialized) => false,
            (_, Uninitialized) => true,
            (Uninitialized, ReadyToBroadcast) => true,
            (ReadyToBroadcast, Broadcasting) | (ReadyToBroadcast, IngestTesting) => true,
            (Broadcasting, Paused) | (Paused, Broadcasting) => true,
            (Broadcasting, ReadyToBroadcast) | (Paused, ReadyToBroadcast) => true,
            (IngestTesting, ReadyToBroadcast) => true,
            _ => false,
        }
    }

    /// Broadcasting or paused
    pub fn is_live(self) -> bool {
        matches!(self, BroadcastState::Broadcasting | BroadcastState::Paused)
    }
}

impl fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// High-level commands a caller may offer to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    Initialize,
    Shutdown,
    StartBroadcast,
    StopBroadcast,
    Pause,
    Resume,
    StartIngestTest,
    CancelIngestTest,
    SkipIngestServer,
    SelectIngestServer,
    RunCommercial,
    SendActionMetadata,
    StartSpanMetadata,
    EndSpanMetadata,
    SetMicrophoneVolume,
    SetSystemVolume,
    RequestGameNameList,
    SetStreamInfo,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operations currently valid in `state`
pub fn allowed_operations(state: BroadcastState) -> BTreeSet<Operation> {
    use Operation::*;
    let lifecycle: &[Operation] = match state {
        BroadcastState::Uninitialized => &[Initialize],
        BroadcastState::ReadyToBroadcast => &[StartBroadcast, StartIngestTest, SelectIngestServer],
        BroadcastState::Broadcasting => &[Pause, StopBroadcast],
        BroadcastState::Paused => &[Resume, StopBroadcast],
        BroadcastState::IngestTesting => &[CancelIngestTest, SkipIngestServer, SelectIngestServer],
    };

    let mut ops: BTreeSet<Operation> = lifecycle.iter().copied().collect();
    ops.insert(Shutdown);
    if state != BroadcastState::Uninitialized {
        ops.extend([SetMicrophoneVolume, SetSystemVolume, RequestGameNameList, SetStreamInfo]);
    }
    if state.is_live() {
        ops.extend([RunCommercial, SendActionMetadata, StartSpanMetadata, EndSpanMetadata]);
    }
    ops
}

/// Where broadcast audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioCaptureMethod {
    /// No game audio
    None,
    /// The engine captures system audio itself
    #[default]
    SystemCapture,
    /// The application submits audio chunks through the pacing loop
    Passthrough,
}

/// Video output parameters handed to the engine on start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub max_kbps: u32,
}

impl VideoParams {
    /// Parameters for a fixed resolution; bitrate follows pixels × fps × bits-per-pixel.
    pub fn for_resolution(width: u32, height: u32, fps: u32) -> Self {
        let kbps = width as f64 * height as f64 * fps as f64 * DEFAULT_BITS_PER_PIXEL as f64 / 1000.0;
        Self {
            width,
            height,
            fps,
            max_kbps: (kbps.round() as u32).clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS),
        }
    }

    /// Largest aligned resolution with the given aspect ratio that fits `max_kbps`.
    pub fn recommended(
        max_kbps: u32,
        fps: u32,
        bits_per_pixel: f32,
        aspect_ratio: f32,
    ) -> Result<Self, BroadcastError> {
        if fps == 0 || fps > MAX_FPS {
            return Err(BroadcastError::InvalidVideoParams(format!(
                "fps must be within 1..={}, got {}",
                MAX_FPS, fps
            )));
        }
        if !(bits_per_pixel > 0.0) || !(aspect_ratio > 0.0) {
            return Err(BroadcastError::InvalidVideoParams(format!(
                "bits per pixel ({}) and aspect ratio ({}) must be positive",
                bits_per_pixel, aspect_ratio
            )));
        }

        let max_kbps = max_kbps.clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS);
        let pixels = max_kbps as f64 * 1000.0 / (bits_per_pixel as f64 * fps as f64);
        let width = (pixels * aspect_ratio as f64).sqrt();
        let height = width / aspect_ratio as f64;

        let width = align_down(width as u32, 32).clamp(32, MAX_WIDTH);
        let height = align_down(height as u32, 16).clamp(16, MAX_HEIGHT);

        Ok(Self {
            width,
            height,
            fps,
            max_kbps,
        })
    }

    pub fn validate(&self) -> Result<(), BroadcastError> {
        let problem = if self.width == 0 || self.width % 32 != 0 || self.width > MAX_WIDTH {
            Some(format!("width {} must be a non-zero multiple of 32 up to {}", self.width, MAX_WIDTH))
        } else if self.height == 0 || self.height % 16 != 0 || self.height > MAX_HEIGHT {
            Some(format!("height {} must be a non-zero multiple of 16 up to {}", self.height, MAX_HEIGHT))
        } else if self.fps == 0 || self.fps > MAX_FPS {
            Some(format!("fps {} must be within 1..={}", self.fps, MAX_FPS))
        } else if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&self.max_kbps) {
            Some(format!(
                "bitrate {} kbps must be within {}..={}",
                self.max_kbps, MIN_BITRATE_KBPS, MAX_BITRATE_KBPS
            ))
        } else {
            None
        };

        match problem {
            Some(reason) => Err(BroadcastError::InvalidVideoParams(reason)),
            None => Ok(()),
        }
    }

    /// Period of the external frame-submission timer (`1000 / fps` ms)
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }
}

fn align_down(value: u32, alignment: u32) -> u32 {
    value - value % alignment
}

/// Everything the start command needs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BroadcastSettings {
    pub video: VideoParams,
    pub audio_capture: AudioCaptureMethod,
    pub capture_microphone: bool,
}

impl BroadcastSettings {
    pub fn new(video: VideoParams, audio_capture: AudioCaptureMethod) -> Self {
        Self {
            video,
            audio_capture,
            capture_microphone: false,
        }
    }
}

/// Channel details shown to viewers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub channel: String,
    pub game: String,
    pub title: String,
}

impl StreamInfo {
    pub fn new(
        channel: impl Into<String>,
        game: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            game: game.into(),
            title: title.into(),
        }
    }
}

/// Whether the service is recording the broadcast for later viewing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivingState {
    pub recording_enabled: bool,
    pub url: Option<String>,
}

/// Timeline marker attached to the live broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    /// Broadcast clock at the moment the marker was sent
    pub broadcast_time: Duration,
    pub description: String,
    pub data: serde_json::Value,
}

/// Sequence id of an open metadata span, issued by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "span#{}", self.0)
    }
}

/// Microphone and system mix levels, each within `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioVolumes {
    pub microphone: f32,
    pub system: f32,
}

impl Default for AudioVolumes {
    fn default() -> Self {
        Self {
            microphone: 1.0,
            system: 1.0,
        }
    }
}

/// Clamp a requested level into `[0, 1]`; NaN becomes 0.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("{operation} is not allowed while {state}")]
    IllegalCommand {
        operation: Operation,
        state: BroadcastState,
    },

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Invalid video parameters: {0}")]
    InvalidVideoParams(String),

    #[error("No ingest server list has been received")]
    NoIngestList,

    #[error("Unknown ingest server: {0}")]
    UnknownIngestServer(String),

    #[error("No open metadata span {0}")]
    UnknownSpan(SpanId),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}
