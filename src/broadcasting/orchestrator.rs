// Broadcast lifecycle orchestration
//
// Owns the lifecycle state, the ingest directory and at most one ingest
// probe. Commands are synchronous: a command either performs its transition
// or is rejected with no state change and no notification. The control loop
// calls `poll` periodically to run engine housekeeping and advance the probe.
//
// Observers are invoked synchronously while the orchestrator is borrowed.
// Behind a shared lock, use `ControlLoop::with_orchestrator`, which defers
// delivery until the lock is released.

use colored::*;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::{BroadcastEngine, Credentials};
use super::events::{
    ArchivingStateEvent, BroadcastEvent, GameNameListEvent, HeldEvents, IngestEvent,
    IngestListEvent, Observers, StateChangedEvent, SubscriptionId,
};
use super::ingest::{
    IngestError, IngestList, IngestListEntry, IngestProbe, IngestProgress, IngestServer,
};
use super::types::{
    allowed_operations, clamp_volume, ArchivingState, AudioCaptureMethod, AudioVolumes,
    BroadcastError, BroadcastSettings, BroadcastState, Metadata, Operation, SpanId, StreamInfo,
};
use crate::audio::{PacingMode, PacingModeFlag};

pub struct BroadcastOrchestrator {
    engine: Box<dyn BroadcastEngine>,
    state: BroadcastState,
    session_id: Option<Uuid>,
    audio_mode: PacingModeFlag,
    settings: Option<BroadcastSettings>,
    broadcast_started_at: Option<Instant>,
    ingest_list: Option<IngestList>,
    selected_server: Option<IngestServer>,
    probe: Option<IngestProbe>,
    open_spans: BTreeMap<SpanId, String>,
    volumes: AudioVolumes,
    stream_info: Option<StreamInfo>,
    archiving: Option<ArchivingState>,
    state_observers: Observers<BroadcastEvent>,
    ingest_observers: Observers<IngestEvent>,
}

impl std::fmt::Debug for BroadcastOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastOrchestrator")
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("settings", &self.settings)
            .field("probe", &self.probe)
            .finish()
    }
}

impl BroadcastOrchestrator {
    /// `audio_mode` is the flag the pacing loop reads; this orchestrator becomes its only writer.
    pub fn new(engine: Box<dyn BroadcastEngine>, audio_mode: PacingModeFlag) -> Self {
        audio_mode.set(PacingMode::Idle);
        Self {
            engine,
            state: BroadcastState::Uninitialized,
            session_id: None,
            audio_mode,
            settings: None,
            broadcast_started_at: None,
            ingest_list: None,
            selected_server: None,
            probe: None,
            open_spans: BTreeMap::new(),
            volumes: AudioVolumes::default(),
            stream_info: None,
            archiving: None,
            state_observers: Observers::new(),
            ingest_observers: Observers::new(),
        }
    }

    pub fn state(&self) -> BroadcastState {
        self.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn allowed_operations(&self) -> BTreeSet<Operation> {
        allowed_operations(self.state)
    }

    pub fn audio_mode(&self) -> PacingModeFlag {
        self.audio_mode.clone()
    }

    pub fn settings(&self) -> Option<&BroadcastSettings> {
        self.settings.as_ref()
    }

    /// Callbacks run synchronously inside the command that caused the event.
    /// They must not lock the orchestrator unless delivery is deferred.
    pub fn subscribe_state_changes<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        self.state_observers.subscribe(callback)
    }

    pub fn unsubscribe_state_changes(&self, id: SubscriptionId) -> bool {
        self.state_observers.unsubscribe(id)
    }

    /// Same delivery rules as `subscribe_state_changes`
    pub fn subscribe_ingest_progress<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&IngestEvent) + Send + Sync + 'static,
    {
        self.ingest_observers.subscribe(callback)
    }

    pub fn unsubscribe_ingest_progress(&self, id: SubscriptionId) -> bool {
        self.ingest_observers.unsubscribe(id)
    }

    /// Buffer every notification until the returned guard is dropped
    pub fn defer_events(&self) -> DeferredEvents {
        DeferredEvents {
            _state: self.state_observers.hold(),
            _ingest: self.ingest_observers.hold(),
        }
    }

    pub fn ingest_list(&self) -> Option<&IngestList> {
        self.ingest_list.as_ref()
    }

    pub fn selected_server(&self) -> Option<&IngestServer> {
        self.selected_server.as_ref()
    }

    /// Ingest list rows with default/selected markers; empty before initialization
    pub fn ingest_entries(&self) -> Vec<IngestListEntry> {
        self.ingest_list
            .as_ref()
            .map(|list| list.entries(self.selected_server.as_ref()))
            .unwrap_or_default()
    }

    /// Progress of the running probe, if any
    pub fn ingest_progress(&self) -> Option<IngestProgress> {
        self.probe.as_ref().map(|p| p.progress())
    }

    /// Time since the broadcast started, paused time included
    pub fn current_broadcast_time(&self) -> Option<Duration> {
        if !self.state.is_live() {
            return None;
        }
        self.broadcast_started_at.map(|started| started.elapsed())
    }

    /// Spans started and not yet ended in the current broadcast
    pub fn open_spans(&self) -> Vec<SpanId> {
        self.open_spans.keys().copied().collect()
    }

    pub fn volumes(&self) -> AudioVolumes {
        self.volumes
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    /// Last archiving state reported by the engine
    pub fn archiving_state(&self) -> Option<&ArchivingState> {
        self.archiving.as_ref()
    }

    // Commands

    /// Initialize the engine and log in, then fetch the ingest directory.
    pub fn initialize(&mut self, credentials: &Credentials) -> Result<(), BroadcastError> {
        self.check(Operation::Initialize)?;
        credentials.validate()?;

        info!("🔧 {}: logging in as {}", "BROADCAST_INIT".blue(), credentials.username);
        if let Err(e) = self.engine.initialize(credentials) {
            error!("❌ {}: {}", "BROADCAST_INIT_FAILED".red(), e);
            return Err(e.into());
        }

        self.session_id = Some(Uuid::new_v4());
        self.ingest_list = self.engine.ingest_list();
        self.selected_server = self
            .ingest_list
            .as_ref()
            .and_then(|list| list.default_server().cloned());

        self.transition(BroadcastState::ReadyToBroadcast);

        match &self.ingest_list {
            Some(list) => {
                info!("📋 Received ingest list with {} servers", list.len());
                self.emit_ingest_list();
            }
            None => warn!("⚠️ Engine provided no ingest list"),
        }
        Ok(())
    }

    pub fn start_broadcast(&mut self, settings: BroadcastSettings) -> Result<(), BroadcastError> {
        self.check(Operation::StartBroadcast)?;
        settings.video.validate()?;

        info!(
            "🎯 {}: {}x{} @ {} fps, {} kbps, audio {:?}",
            "BROADCAST_START".green(),
            settings.video.width,
            settings.video.height,
            settings.video.fps,
            settings.video.max_kbps,
            settings.audio_capture
        );
        self.engine.start_broadcast(&settings)?;

        self.settings = Some(settings);
        self.broadcast_started_at = Some(Instant::now());
        self.transition(BroadcastState::Broadcasting);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), BroadcastError> {
        self.check(Operation::Pause)?;
        self.engine.pause_broadcast()?;
        info!("⏸️ {}", "BROADCAST_PAUSE".yellow());
        self.transition(BroadcastState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), BroadcastError> {
        self.check(Operation::Resume)?;
        self.engine.resume_broadcast()?;
        info!("▶️ {}", "BROADCAST_RESUME".green());
        self.transition(BroadcastState::Broadcasting);
        Ok(())
    }

    /// Stop the broadcast. An engine error is logged; the broadcast is considered over either way.
    pub fn stop_broadcast(&mut self) -> Result<(), BroadcastError> {
        self.check(Operation::StopBroadcast)?;
        if let Err(e) = self.engine.stop_broadcast() {
            warn!("⚠️ {}: engine reported {}", "BROADCAST_STOP".yellow(), e);
        }
        self.end_broadcast();
        Ok(())
    }

    /// Begin measuring every server in the ingest list
    pub fn start_ingest_test(&mut self) -> Result<(), BroadcastError> {
        self.check(Operation::StartIngestTest)?;
        let list = self.ingest_list.as_ref().ok_or(BroadcastError::NoIngestList)?;

        let connector = self.engine.ingest_connector();
        let mut probe = IngestProbe::new(list, connector, self.ingest_observers.clone());
        info!(
            "📡 {}: probe {} over {} servers",
            "INGEST_TEST".green(),
            probe.id(),
            list.len()
        );

        self.transition(BroadcastState::IngestTesting);
        probe.start()?;
        let finished = probe.state().is_terminal();
        self.probe = Some(probe);
        if finished {
            self.reap_probe();
        }
        Ok(())
    }

    /// Cancel the running probe. Rejected when no probe is active.
    pub fn cancel_ingest_test(&mut self) -> Result<(), BroadcastError> {
        self.check(Operation::CancelIngestTest)?;
        match self.probe.as_mut() {
            Some(probe) if !probe.state().is_terminal() => probe.cancel()?,
            _ => return Err(IngestError::NoActiveTest.into()),
        }
        self.reap_probe();
        Ok(())
    }

    /// Skipping the last server ends the probe and returns to `ReadyToBroadcast`.
    pub fn skip_ingest_server(&mut self) -> Result<(), BroadcastError> {
        self.check(Operation::SkipIngestServer)?;
        let probe = self.probe.as_mut().ok_or(IngestError::NoActiveTest)?;
        if probe.skip_current_server()?.is_terminal() {
            self.reap_probe();
        }
        Ok(())
    }

    /// Mark a server (by URL or name) as the one to broadcast to
    pub fn select_ingest_server(&mut self, key: &str) -> Result<(), BroadcastError> {
        self.check(Operation::SelectIngestServer)?;
        let server = self
            .ingest_list
            .as_ref()
            .ok_or(BroadcastError::NoIngestList)?
            .find(key)
            .cloned()
            .ok_or_else(|| BroadcastError::UnknownIngestServer(key.to_string()))?;

        self.engine.select_ingest_server(&server)?;
        info!("🎯 {}: {}", "INGEST_SELECT".blue(), server.name);
        self.selected_server = Some(server);
        Ok(())
    }

    pub fn run_commercial(&mut self) -> Result<(), BroadcastError> {
        self.check(Operation::RunCommercial)?;
        self.engine.run_commercial()?;
        info!("📺 {}", "COMMERCIAL".magenta());
        Ok(())
    }

    /// Send a point-in-time marker stamped with the broadcast clock.
    /// Returns the stamp.
    pub fn send_action_metadata(
        &mut self,
        name: &str,
        description: &str,
        data: serde_json::Value,
    ) -> Result<Duration, BroadcastError> {
        self.check(Operation::SendActionMetadata)?;
        let action = self.metadata(name, description, data);
        self.engine.send_action_metadata(&action)?;
        debug!("Action metadata {} at {:?}", action.name, action.broadcast_time);
        Ok(action.broadcast_time)
    }

    pub fn start_span_metadata(
        &mut self,
        name: &str,
        description: &str,
        data: serde_json::Value,
    ) -> Result<SpanId, BroadcastError> {
        self.check(Operation::StartSpanMetadata)?;
        let span = self.metadata(name, description, data);
        let id = self.engine.start_span_metadata(&span)?;
        debug!("Opened {} ({}) at {:?}", id, span.name, span.broadcast_time);
        self.open_spans.insert(id, span.name);
        Ok(id)
    }

    /// Close a span opened by `start_span_metadata` in this broadcast
    pub fn end_span_metadata(
        &mut self,
        id: SpanId,
        description: &str,
        data: serde_json::Value,
    ) -> Result<(), BroadcastError> {
        self.check(Operation::EndSpanMetadata)?;
        let name = self
            .open_spans
            .get(&id)
            .cloned()
            .ok_or(BroadcastError::UnknownSpan(id))?;
        let end = self.metadata(&name, description, data);
        self.engine.end_span_metadata(id, &end)?;
        debug!("Closed {} ({}) at {:?}", id, name, end.broadcast_time);
        self.open_spans.remove(&id);
        Ok(())
    }

    /// Returns the level applied after clamping to `[0, 1]`
    pub fn set_microphone_volume(&mut self, volume: f32) -> Result<f32, BroadcastError> {
        self.check(Operation::SetMicrophoneVolume)?;
        let volume = clamp_volume(volume);
        self.engine.set_microphone_volume(volume)?;
        self.volumes.microphone = volume;
        info!("🎙️ {}: {:.1}", "MIC_VOLUME".blue(), volume);
        Ok(volume)
    }

    pub fn adjust_microphone_volume(&mut self, delta: f32) -> Result<f32, BroadcastError> {
        self.set_microphone_volume(self.volumes.microphone + delta)
    }

    /// Returns the level applied after clamping to `[0, 1]`
    pub fn set_system_volume(&mut self, volume: f32) -> Result<f32, BroadcastError> {
        self.check(Operation::SetSystemVolume)?;
        let volume = clamp_volume(volume);
        self.engine.set_system_volume(volume)?;
        self.volumes.system = volume;
        info!("🔊 {}: {:.1}", "SYSTEM_VOLUME".blue(), volume);
        Ok(volume)
    }

    pub fn adjust_system_volume(&mut self, delta: f32) -> Result<f32, BroadcastError> {
        self.set_system_volume(self.volumes.system + delta)
    }

    /// Look up game names matching `query` and announce them to observers
    pub fn request_game_name_list(&mut self, query: &str) -> Result<Vec<String>, BroadcastError> {
        self.check(Operation::RequestGameNameList)?;
        let names = self.engine.game_name_list(query)?;
        debug!("{} game names match {:?}", names.len(), query);
        self.state_observers
            .emit(&BroadcastEvent::GameNameListReceived(GameNameListEvent {
                session_id: self.session_id,
                query: query.to_string(),
                names: names.clone(),
                timestamp: chrono::Utc::now(),
            }));
        Ok(names)
    }

    pub fn set_stream_info(&mut self, info: StreamInfo) -> Result<(), BroadcastError> {
        self.check(Operation::SetStreamInfo)?;
        self.engine.set_stream_info(&info)?;
        info!(
            "📝 {}: {} playing {} - {}",
            "STREAM_INFO".blue(),
            info.channel,
            info.game,
            info.title
        );
        self.stream_info = Some(info);
        Ok(())
    }

    /// Tear everything down and return to `Uninitialized`. Always accepted.
    pub fn shutdown(&mut self) {
        if self.state == BroadcastState::Uninitialized {
            debug!("Shutdown requested while uninitialized; nothing to do");
            return;
        }

        info!("🛑 {}: leaving {}", "BROADCAST_SHUTDOWN".red(), self.state);

        if let Some(mut probe) = self.probe.take() {
            if !probe.state().is_terminal() {
                let _ = probe.cancel();
            }
        }
        if self.state.is_live() {
            if let Err(e) = self.engine.stop_broadcast() {
                warn!("⚠️ Stop during shutdown failed: {}", e);
            }
        }
        self.engine.shutdown();

        self.settings = None;
        self.broadcast_started_at = None;
        self.open_spans.clear();
        self.ingest_list = None;
        self.selected_server = None;
        self.volumes = AudioVolumes::default();
        self.stream_info = None;
        self.archiving = None;
        self.transition(BroadcastState::Uninitialized);
        self.session_id = None;
    }

    /// One control-loop step: engine housekeeping, then one probe step.
    pub fn poll(&mut self) -> BroadcastState {
        if self.state == BroadcastState::Uninitialized {
            return self.state;
        }

        if let Err(e) = self.engine.update() {
            if self.state.is_live() {
                warn!(
                    "⚠️ {}: broadcast ended by engine: {}",
                    "BROADCAST_LOST".yellow(),
                    e
                );
                self.end_broadcast();
            } else {
                debug!("Engine update failed outside a broadcast: {}", e);
            }
        }
        self.refresh_archiving_state();

        if let Some(probe) = self.probe.as_mut() {
            if probe.advance().is_terminal() {
                self.reap_probe();
            }
        }

        self.state
    }

    fn check(&self, operation: Operation) -> Result<(), BroadcastError> {
        if allowed_operations(self.state).contains(&operation) {
            Ok(())
        } else {
            debug!("Rejected {} while {}", operation, self.state);
            Err(BroadcastError::IllegalCommand {
                operation,
                state: self.state,
            })
        }
    }

    fn end_broadcast(&mut self) {
        if let Some(elapsed) = self.current_broadcast_time() {
            info!(
                "✅ {}: broadcast lasted {:.1}s",
                "BROADCAST_STOP".green(),
                elapsed.as_secs_f64()
            );
        }
        if !self.open_spans.is_empty() {
            warn!("⚠️ {} metadata spans left open at broadcast end", self.open_spans.len());
            self.open_spans.clear();
        }
        self.settings = None;
        self.broadcast_started_at = None;
        self.transition(BroadcastState::ReadyToBroadcast);
    }

    fn metadata(&self, name: &str, description: &str, data: serde_json::Value) -> Metadata {
        Metadata {
            name: name.to_string(),
            broadcast_time: self.current_broadcast_time().unwrap_or_default(),
            description: description.to_string(),
            data,
        }
    }

    fn refresh_archiving_state(&mut self) {
        let Some(latest) = self.engine.archiving_state() else {
            return;
        };
        if self.archiving.as_ref() == Some(&latest) {
            return;
        }

        info!(
            "🗄️ {}: recording {}",
            "ARCHIVING".blue(),
            if latest.recording_enabled { "enabled" } else { "disabled" }
        );
        self.archiving = Some(latest.clone());
        self.state_observers
            .emit(&BroadcastEvent::ArchivingStateChanged(ArchivingStateEvent {
                session_id: self.session_id,
                archiving: latest,
                timestamp: chrono::Utc::now(),
            }));
    }

    /// Drop the probe, keep its measurements, and leave `IngestTesting`
    fn reap_probe(&mut self) {
        let Some(probe) = self.probe.take() else {
            if self.state == BroadcastState::IngestTesting {
                self.transition(BroadcastState::ReadyToBroadcast);
            }
            return;
        };

        if let Some(list) = self.ingest_list.as_mut() {
            list.apply_measurements(probe.servers());
        }
        info!(
            "📡 {}: probe {} ended {} ({}/{} servers)",
            "INGEST_TEST_DONE".green(),
            probe.id(),
            probe.state(),
            probe.servers_completed(),
            probe.servers().len()
        );
        drop(probe);

        if self.state == BroadcastState::IngestTesting {
            self.transition(BroadcastState::ReadyToBroadcast);
        }
        self.emit_ingest_list();
    }

    fn transition(&mut self, next: BroadcastState) {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            error!("❌ Refusing illegal transition {} -> {}", previous, next);
            return;
        }

        self.state = next;
        self.refresh_audio_mode();
        debug!("Broadcast state {} -> {}", previous, next);

        self.state_observers
            .emit(&BroadcastEvent::StateChanged(StateChangedEvent {
                session_id: self.session_id,
                previous,
                current: next,
                allowed_operations: allowed_operations(next).into_iter().collect(),
                timestamp: chrono::Utc::now(),
            }));
    }

    fn refresh_audio_mode(&self) {
        let passthrough = self.state == BroadcastState::Broadcasting
            && self
                .settings
                .map(|s| s.audio_capture == AudioCaptureMethod::Passthrough)
                .unwrap_or(false);
        let mode = if passthrough {
            PacingMode::Passthrough
        } else {
            PacingMode::Idle
        };

        let previous = self.audio_mode.set(mode);
        if previous != mode {
            info!("🎵 {}: {:?} -> {:?}", "AUDIO_MODE".blue(), previous, mode);
        }
    }

    fn emit_ingest_list(&self) {
        if self.ingest_list.is_none() {
            return;
        }
        self.state_observers
            .emit(&BroadcastEvent::IngestListReceived(IngestListEvent {
                session_id: self.session_id,
                servers: self.ingest_entries(),
                timestamp: chrono::Utc::now(),
            }));
    }
}

/// Outstanding hold on both observer lists, from `defer_events`
#[must_use = "events are delivered when this is dropped"]
pub struct DeferredEvents {
    _state: HeldEvents<BroadcastEvent>,
    _ingest: HeldEvents<IngestEvent>,
}

impl Drop for BroadcastOrchestrator {
    fn drop(&mut self) {
        self.audio_mode.set(PacingMode::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcasting::engine::EngineError;
    use crate::broadcasting::ingest::{IngestConnector, IngestTestState};
    use crate::broadcasting::types::VOLUME_STEP;
    use crate::broadcasting::measurement::MeasurementHandle;
    use crate::broadcasting::types::VideoParams;
    use std::sync::{Arc, Mutex};

    /// Connector that completes every measurement immediately
    struct InstantConnector;

    impl IngestConnector for InstantConnector {
        fn connect(&mut self, _server: &IngestServer) -> Result<MeasurementHandle, IngestError> {
            let handle = MeasurementHandle::new();
            handle.complete(1500.0);
            Ok(handle)
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        fail_update: Arc<Mutex<bool>>,
        archiving: Arc<Mutex<Option<ArchivingState>>>,
        metadata: Arc<Mutex<Vec<Metadata>>>,
        next_span: u64,
    }

    impl BroadcastEngine for FakeEngine {
        fn initialize(&mut self, _credentials: &Credentials) -> Result<(), EngineError> {
            Ok(())
        }

        fn ingest_list(&mut self) -> Option<IngestList> {
            Some(IngestList::new(
                vec![
                    IngestServer::new("A", "rtmp://a"),
                    IngestServer::new("B", "rtmp://b"),
                ],
                Some(1),
            ))
        }

        fn select_ingest_server(&mut self, _server: &IngestServer) -> Result<(), EngineError> {
            Ok(())
        }

        fn start_broadcast(&mut self, _settings: &BroadcastSettings) -> Result<(), EngineError> {
            Ok(())
        }

        fn pause_broadcast(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn resume_broadcast(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn stop_broadcast(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn ingest_connector(&mut self) -> Box<dyn IngestConnector> {
            Box::new(InstantConnector)
        }

        fn update(&mut self) -> Result<(), EngineError> {
            if *self.fail_update.lock().unwrap() {
                Err(EngineError::Disconnected("socket closed".to_string()))
            } else {
                Ok(())
            }
        }

        fn shutdown(&mut self) {}

        fn run_commercial(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn send_action_metadata(&mut self, action: &Metadata) -> Result<(), EngineError> {
            self.metadata.lock().unwrap().push(action.clone());
            Ok(())
        }

        fn start_span_metadata(&mut self, span: &Metadata) -> Result<SpanId, EngineError> {
            self.metadata.lock().unwrap().push(span.clone());
            self.next_span += 1;
            Ok(SpanId(self.next_span))
        }

        fn end_span_metadata(&mut self, _span: SpanId, end: &Metadata) -> Result<(), EngineError> {
            self.metadata.lock().unwrap().push(end.clone());
            Ok(())
        }

        fn set_microphone_volume(&mut self, _volume: f32) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_system_volume(&mut self, _volume: f32) -> Result<(), EngineError> {
            Ok(())
        }

        fn archiving_state(&mut self) -> Option<ArchivingState> {
            self.archiving.lock().unwrap().clone()
        }
    }

    fn ready_orchestrator() -> (BroadcastOrchestrator, Arc<Mutex<Vec<BroadcastState>>>) {
        let mut orchestrator =
            BroadcastOrchestrator::new(Box::new(FakeEngine::default()), PacingModeFlag::default());
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        orchestrator.subscribe_state_changes(move |event| {
            if let BroadcastEvent::StateChanged(change) = event {
                sink.lock().unwrap().push(change.current);
            }
        });
        orchestrator
            .initialize(&Credentials::new("id", "secret", "user"))
            .unwrap();
        (orchestrator, states)
    }

    fn passthrough_settings() -> BroadcastSettings {
        BroadcastSettings::new(
            VideoParams::for_resolution(1280, 720, 30),
            AudioCaptureMethod::Passthrough,
        )
    }

    #[test]
    fn test_pause_from_ready_is_rejected_silently() {
        let (mut orchestrator, states) = ready_orchestrator();
        assert_eq!(*states.lock().unwrap(), vec![BroadcastState::ReadyToBroadcast]);

        let err = orchestrator.pause().unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::IllegalCommand {
                operation: Operation::Pause,
                state: BroadcastState::ReadyToBroadcast
            }
        ));
        assert_eq!(orchestrator.state(), BroadcastState::ReadyToBroadcast);
        assert_eq!(states.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_pause_resume_stop_cycle() {
        let (mut orchestrator, states) = ready_orchestrator();
        let mode = orchestrator.audio_mode();

        orchestrator.start_broadcast(passthrough_settings()).unwrap();
        assert_eq!(mode.get(), PacingMode::Passthrough);
        assert!(orchestrator.current_broadcast_time().is_some());

        orchestrator.pause().unwrap();
        assert_eq!(orchestrator.state(), BroadcastState::Paused);
        assert_eq!(mode.get(), PacingMode::Idle);

        orchestrator.resume().unwrap();
        assert_eq!(mode.get(), PacingMode::Passthrough);

        orchestrator.stop_broadcast().unwrap();
        assert_eq!(mode.get(), PacingMode::Idle);
        assert!(orchestrator.current_broadcast_time().is_none());

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                BroadcastState::ReadyToBroadcast,
                BroadcastState::Broadcasting,
                BroadcastState::Paused,
                BroadcastState::Broadcasting,
                BroadcastState::ReadyToBroadcast,
            ]
        );
    }

    #[test]
    fn test_system_capture_keeps_pacing_idle() {
        let (mut orchestrator, _) = ready_orchestrator();
        let settings = BroadcastSettings::new(
            VideoParams::for_resolution(1280, 720, 30),
            AudioCaptureMethod::SystemCapture,
        );
        orchestrator.start_broadcast(settings).unwrap();
        assert_eq!(orchestrator.audio_mode().get(), PacingMode::Idle);
    }

    #[test]
    fn test_invalid_video_params_reject_start() {
        let (mut orchestrator, _) = ready_orchestrator();
        let mut settings = passthrough_settings();
        settings.video.width = 1000;
        assert!(matches!(
            orchestrator.start_broadcast(settings),
            Err(BroadcastError::InvalidVideoParams(_))
        ));
        assert_eq!(orchestrator.state(), BroadcastState::ReadyToBroadcast);
    }

    #[test]
    fn test_ingest_test_round_trip_through_polls() {
        let (mut orchestrator, states) = ready_orchestrator();
        orchestrator.start_ingest_test().unwrap();
        assert_eq!(orchestrator.state(), BroadcastState::IngestTesting);
        assert!(orchestrator.start_broadcast(passthrough_settings()).is_err());

        let mut polls = 0;
        while orchestrator.poll() == BroadcastState::IngestTesting {
            polls += 1;
            assert!(polls < 20, "probe never finished");
        }

        assert_eq!(orchestrator.state(), BroadcastState::ReadyToBroadcast);
        assert!(orchestrator.ingest_progress().is_none());
        let list = orchestrator.ingest_list().unwrap();
        assert!(list.servers().iter().all(|s| s.bitrate_kbps == 1500.0));
        assert_eq!(
            states.lock().unwrap().last().copied(),
            Some(BroadcastState::ReadyToBroadcast)
        );
    }

    #[test]
    fn test_cancel_ingest_test_returns_to_ready() {
        let (mut orchestrator, _) = ready_orchestrator();
        orchestrator.start_ingest_test().unwrap();
        orchestrator.cancel_ingest_test().unwrap();
        assert_eq!(orchestrator.state(), BroadcastState::ReadyToBroadcast);
        assert!(orchestrator.cancel_ingest_test().is_err());
    }

    #[test]
    fn test_engine_error_while_live_stops_broadcast() {
        let engine = FakeEngine::default();
        let fail = engine.fail_update.clone();
        let mut orchestrator = BroadcastOrchestrator::new(Box::new(engine), PacingModeFlag::default());
        orchestrator
            .initialize(&Credentials::new("id", "secret", "user"))
            .unwrap();
        orchestrator.start_broadcast(passthrough_settings()).unwrap();

        *fail.lock().unwrap() = true;
        assert_eq!(orchestrator.poll(), BroadcastState::ReadyToBroadcast);
        assert_eq!(orchestrator.audio_mode().get(), PacingMode::Idle);
    }

    #[test]
    fn test_select_server_marks_entry() {
        let (mut orchestrator, _) = ready_orchestrator();
        assert_eq!(
            orchestrator.selected_server().map(|s| s.name.as_str()),
            Some("B")
        );
        orchestrator.select_ingest_server("A").unwrap();
        let rows: Vec<String> = orchestrator.ingest_entries().iter().map(|e| e.to_string()).collect();
        assert_eq!(rows, vec!["* A - 0 kbps", "B (Default) - 0 kbps"]);
        assert!(matches!(
            orchestrator.select_ingest_server("Z"),
            Err(BroadcastError::UnknownIngestServer(_))
        ));
    }

    #[test]
    fn test_shutdown_from_any_state() {
        let (mut orchestrator, states) = ready_orchestrator();
        orchestrator.start_broadcast(passthrough_settings()).unwrap();
        orchestrator.shutdown();
        assert_eq!(orchestrator.state(), BroadcastState::Uninitialized);
        assert_eq!(orchestrator.audio_mode().get(), PacingMode::Idle);
        assert!(orchestrator.session_id().is_none());

        let count = states.lock().unwrap().len();
        orchestrator.shutdown();
        assert_eq!(states.lock().unwrap().len(), count);
    }

    #[test]
    fn test_skip_moves_probe_to_next_server() {
        let (mut orchestrator, _) = ready_orchestrator();
        orchestrator.start_ingest_test().unwrap();
        orchestrator.skip_ingest_server().unwrap();
        let progress = orchestrator.ingest_progress().unwrap();
        assert_eq!(progress.servers_completed, 1);
        assert_eq!(progress.state, IngestTestState::ConnectingToServer);
    }

    #[test]
    fn test_skipping_last_server_returns_to_ready() {
        let (mut orchestrator, states) = ready_orchestrator();
        orchestrator.start_ingest_test().unwrap();
        orchestrator.skip_ingest_server().unwrap();
        orchestrator.skip_ingest_server().unwrap();

        assert_eq!(orchestrator.state(), BroadcastState::ReadyToBroadcast);
        assert!(orchestrator.ingest_progress().is_none());
        assert_eq!(
            states.lock().unwrap().last().copied(),
            Some(BroadcastState::ReadyToBroadcast)
        );
        orchestrator.start_broadcast(passthrough_settings()).unwrap();
    }

    #[test]
    fn test_cancel_rejected_once_probe_has_ended() {
        let (mut orchestrator, _) = ready_orchestrator();
        orchestrator.start_ingest_test().unwrap();
        orchestrator.probe.as_mut().unwrap().cancel().unwrap();

        assert!(matches!(
            orchestrator.cancel_ingest_test(),
            Err(BroadcastError::Ingest(IngestError::NoActiveTest))
        ));
        assert_eq!(orchestrator.state(), BroadcastState::IngestTesting);
        assert_eq!(orchestrator.poll(), BroadcastState::ReadyToBroadcast);
    }

    #[test]
    fn test_metadata_is_stamped_with_broadcast_clock() {
        let engine = FakeEngine::default();
        let sent = engine.metadata.clone();
        let mut orchestrator = BroadcastOrchestrator::new(Box::new(engine), PacingModeFlag::default());
        orchestrator
            .initialize(&Credentials::new("id", "secret", "user"))
            .unwrap();
        assert!(orchestrator
            .send_action_metadata("kill", "", serde_json::Value::Null)
            .is_err());

        orchestrator.start_broadcast(passthrough_settings()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let stamp = orchestrator
            .send_action_metadata("kill", "human", serde_json::json!({ "awesome": 1 }))
            .unwrap();
        assert!(stamp >= Duration::from_millis(5));

        let span = orchestrator
            .start_span_metadata("round", "Round 1", serde_json::json!({ "phase": "start" }))
            .unwrap();
        assert_eq!(orchestrator.open_spans(), vec![span]);
        orchestrator.pause().unwrap();
        orchestrator
            .end_span_metadata(span, "Round 1", serde_json::json!({ "phase": "end" }))
            .unwrap();
        assert!(orchestrator.open_spans().is_empty());
        assert!(matches!(
            orchestrator.end_span_metadata(span, "", serde_json::Value::Null),
            Err(BroadcastError::UnknownSpan(id)) if id == span
        ));

        let sent = sent.lock().unwrap();
        let names: Vec<&str> = sent.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["kill", "round", "round"]);
        assert!(sent.windows(2).all(|w| w[1].broadcast_time >= w[0].broadcast_time));
        assert_eq!(sent[0].data["awesome"], 1);
    }

    #[test]
    fn test_open_spans_close_with_broadcast() {
        let (mut orchestrator, _) = ready_orchestrator();
        orchestrator.start_broadcast(passthrough_settings()).unwrap();
        orchestrator.run_commercial().unwrap();
        orchestrator
            .start_span_metadata("match", "", serde_json::Value::Null)
            .unwrap();
        orchestrator.stop_broadcast().unwrap();
        assert!(orchestrator.open_spans().is_empty());
        assert!(orchestrator.run_commercial().is_err());
    }

    #[test]
    fn test_volume_steps_are_clamped() {
        let (mut orchestrator, _) = ready_orchestrator();
        assert_eq!(orchestrator.adjust_microphone_volume(VOLUME_STEP).unwrap(), 1.0);
        let mut level = 1.0;
        for _ in 0..12 {
            level = orchestrator.adjust_system_volume(-VOLUME_STEP).unwrap();
        }
        assert_eq!(level, 0.0);
        assert_eq!(orchestrator.volumes().system, 0.0);

        let lowered = orchestrator.adjust_microphone_volume(-VOLUME_STEP).unwrap();
        assert!((lowered - 0.9).abs() < 1e-6);

        orchestrator.shutdown();
        assert_eq!(orchestrator.volumes(), AudioVolumes::default());
        assert!(orchestrator.set_microphone_volume(0.5).is_err());
    }

    #[test]
    fn test_archiving_change_is_announced_once() {
        let engine = FakeEngine::default();
        let archiving = engine.archiving.clone();
        let mut orchestrator = BroadcastOrchestrator::new(Box::new(engine), PacingModeFlag::default());
        let announced = Arc::new(Mutex::new(Vec::new()));
        let sink = announced.clone();
        orchestrator.subscribe_state_changes(move |event| {
            if let BroadcastEvent::ArchivingStateChanged(change) = event {
                sink.lock().unwrap().push(change.archiving.recording_enabled);
            }
        });
        orchestrator
            .initialize(&Credentials::new("id", "secret", "user"))
            .unwrap();

        orchestrator.poll();
        assert!(orchestrator.archiving_state().is_none());

        *archiving.lock().unwrap() = Some(ArchivingState {
            recording_enabled: true,
            url: None,
        });
        orchestrator.poll();
        orchestrator.poll();
        assert_eq!(*announced.lock().unwrap(), vec![true]);
        assert!(orchestrator.archiving_state().unwrap().recording_enabled);
    }

    #[test]
    fn test_stream_info_and_game_names_need_initialization() {
        let mut orchestrator =
            BroadcastOrchestrator::new(Box::new(FakeEngine::default()), PacingModeFlag::default());
        let info = StreamInfo::new("channel", "Chess", "Blitz");
        assert!(orchestrator.set_stream_info(info.clone()).is_err());
        assert!(orchestrator.request_game_name_list("che").is_err());

        orchestrator
            .initialize(&Credentials::new("id", "secret", "user"))
            .unwrap();
        // FakeEngine leaves both capabilities at their unsupported defaults
        assert!(matches!(
            orchestrator.set_stream_info(info),
            Err(BroadcastError::Engine(EngineError::Unsupported(_)))
        ));
        assert!(orchestrator.stream_info().is_none());
    }

    #[test]
    fn test_deferred_events_wait_for_guard() {
        let (mut orchestrator, states) = ready_orchestrator();
        let deferred = orchestrator.defer_events();
        orchestrator.start_broadcast(passthrough_settings()).unwrap();
        assert_eq!(states.lock().unwrap().len(), 1);
        drop(deferred);
        assert_eq!(
            *states.lock().unwrap(),
            vec![BroadcastState::ReadyToBroadcast, BroadcastState::Broadcasting]
        );
    }
}
