// Broadcasting module - lifecycle and ingest orchestration
//
// - types: lifecycle states, operations and video/broadcast settings
// - engine: boundary to the external network engine
// - events: ordered observer lists and event payloads
// - measurement: lock-free progress cell for one bandwidth measurement
// - ingest: ingest server list and the bandwidth probe state machine
// - orchestrator: the lifecycle state machine
// - driver: the non-reentrant periodic control loop

pub mod driver;
pub mod engine;
pub mod events;
pub mod ingest;
pub mod measurement;
pub mod orchestrator;
pub mod types;

pub use driver::{ControlLoop, PollOutcome};
pub use engine::{BroadcastEngine, Credentials, EngineError};
pub use events::{
    ArchivingStateEvent, BroadcastEvent, GameNameListEvent, HeldEvents, IngestEvent,
    IngestListEvent, Observers, StateChangedEvent, SubscriptionId,
};
pub use ingest::{
    IngestConnector, IngestError, IngestList, IngestListEntry, IngestProbe, IngestProgress,
    IngestServer, IngestTestState,
};
pub use measurement::{MeasurementHandle, MeasurementPhase};
pub use orchestrator::BroadcastOrchestrator;
pub use types::{
    allowed_operations, clamp_volume, ArchivingState, AudioCaptureMethod, AudioVolumes,
    BroadcastError, BroadcastSettings, BroadcastState, Metadata, Operation, SpanId, StreamInfo,
    VideoParams, MAX_BITRATE_KBPS, MIN_BITRATE_KBPS, VOLUME_STEP,
};
