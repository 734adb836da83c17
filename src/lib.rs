pub mod audio;
pub mod broadcasting;
pub mod config;
pub mod log;
pub mod session;

// Re-export the main types for testing and external use
pub use audio::{
    AudioChunk, AudioChunkGenerator, AudioFormat, AudioPacingLoop, AudioSink, PacingClock,
    PacingHandle, PacingMode, PacingModeFlag, RingBufferSink, SinkError, ToneSettings,
    WaitStrategy,
};
pub use broadcasting::{
    allowed_operations, AudioCaptureMethod, BroadcastEngine, BroadcastError, BroadcastEvent,
    BroadcastOrchestrator, BroadcastSettings, BroadcastState, ControlLoop, Credentials,
    EngineError, IngestConnector, IngestEvent, IngestList, IngestProbe, IngestServer,
    IngestTestState, Metadata, Operation, SpanId, StreamInfo, VideoParams,
};
pub use config::{ConfigError, ControlConfig, CoreConfig, PacingConfig};
pub use session::BroadcastSession;
