// Ingest server bandwidth probe
//
// Measures achievable upload bitrate against each candidate ingest server in
// turn. The probe is advanced one step per control-loop poll; the measurement
// itself runs elsewhere and publishes through a `MeasurementHandle`.
//
//   Idle -> ConnectingToServer -> TestingServer* -> DoneTestingServer
//        -> (ConnectingToServer for the next server | Finished)
//   any non-terminal state -> Cancelled
//
// A server that cannot be reached is recorded with whatever bitrate was
// measured (usually 0) and the probe moves on; one bad server never aborts
// the whole test.

use colored::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{IngestEvent, Observers};
use super::measurement::{MeasurementHandle, MeasurementPhase};

/// A candidate upload endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestServer {
    pub name: String,
    pub url: String,
    /// Advertised or measured bitrate
    pub bitrate_kbps: f32,
}

impl IngestServer {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            bitrate_kbps: 0.0,
        }
    }

    /// Servers are identified by their endpoint URL
    pub fn same_endpoint(&self, other: &IngestServer) -> bool {
        self.url == other.url
    }
}

/// Ordered server list with a designated default, received once from the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestList {
    servers: Vec<IngestServer>,
    default_index: Option<usize>,
}

impl IngestList {
    /// `default_index` outside the list means no default
    pub fn new(servers: Vec<IngestServer>, default_index: Option<usize>) -> Self {
        let default_index = default_index.filter(|&i| i < servers.len());
        Self {
            servers,
            default_index,
        }
    }

    pub fn servers(&self) -> &[IngestServer] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn default_server(&self) -> Option<&IngestServer> {
        self.default_index.and_then(|i| self.servers.get(i))
    }

    pub fn is_default(&self, server: &IngestServer) -> bool {
        self.default_server()
            .map(|d| d.same_endpoint(server))
            .unwrap_or(false)
    }

    /// Look a server up by URL, then by name
    pub fn find(&self, key: &str) -> Option<&IngestServer> {
        self.servers
            .iter()
            .find(|s| s.url == key)
            .or_else(|| self.servers.iter().find(|s| s.name == key))
    }

    /// Copy bitrates from probed servers onto the matching entries
    pub fn apply_measurements(&mut self, measured: &[IngestServer]) {
        for server in self.servers.iter_mut() {
            if let Some(m) = measured.iter().find(|m| m.same_endpoint(server)) {
                server.bitrate_kbps = m.bitrate_kbps;
            }
        }
    }

    /// Display rows annotated with default/selected markers
    pub fn entries(&self, selected: Option<&IngestServer>) -> Vec<IngestListEntry> {
        self.servers
            .iter()
            .map(|server| IngestListEntry {
                server_name: server.name.clone(),
                url: server.url.clone(),
                bitrate_kbps: server.bitrate_kbps,
                is_default: self.is_default(server),
                is_selected: selected.map(|s| s.same_endpoint(server)).unwrap_or(false),
            })
            .collect()
    }
}

/// One row of the ingest list as presented to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestListEntry {
    pub server_name: String,
    pub url: String,
    pub bitrate_kbps: f32,
    pub is_default: bool,
    pub is_selected: bool,
}

impl fmt::Display for IngestListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_selected {
            write!(f, "* ")?;
        }
        write!(f, "{}", self.server_name)?;
        if self.is_default {
            write!(f, " (Default)")?;
        }
        write!(f, " - {} kbps", self.bitrate_kbps.round() as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestTestState {
    Idle,
    ConnectingToServer,
    TestingServer,
    DoneTestingServer,
    Finished,
    Cancelled,
}

impl IngestTestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IngestTestState::Finished | IngestTestState::Cancelled)
    }
}

impl fmt::Display for IngestTestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Point-in-time view of a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestProgress {
    pub state: IngestTestState,
    pub server_index: Option<usize>,
    pub server_name: Option<String>,
    pub server_bitrate_kbps: f32,
    pub servers_completed: usize,
    pub total_servers: usize,
    pub server_progress: f32,
    pub total_progress: f32,
}

impl fmt::Display for IngestProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}%] {}",
            percent(self.total_progress),
            self.state
        )?;
        let Some(name) = &self.server_name else {
            return Ok(());
        };
        match self.state {
            IngestTestState::ConnectingToServer => write!(f, ": {}...", name),
            IngestTestState::TestingServer => write!(
                f,
                ": {}... {} kbps [{}%]",
                name,
                self.server_bitrate_kbps.round() as i64,
                percent(self.server_progress)
            ),
            IngestTestState::DoneTestingServer => write!(
                f,
                ": {}... {} kbps",
                name,
                self.server_bitrate_kbps.round() as i64
            ),
            _ => Ok(()),
        }
    }
}

fn percent(fraction: f32) -> u32 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u32
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Ingest test already started (state: {0})")]
    AlreadyStarted(IngestTestState),

    #[error("Command not valid while ingest test is {0}")]
    InvalidState(IngestTestState),

    #[error("No ingest test is active")]
    NoActiveTest,

    #[error("Could not reach ingest server {server}: {reason}")]
    ConnectionFailed { server: String, reason: String },
}

/// Opens bandwidth-test connections; implemented by the network engine.
pub trait IngestConnector: Send {
    /// Begin measuring against `server`. An error counts as a failed server.
    fn connect(&mut self, server: &IngestServer) -> Result<MeasurementHandle, IngestError>;

    /// Release whatever `connect` opened for `server`
    fn disconnect(&mut self, _server: &IngestServer) {}
}

pub struct IngestProbe {
    id: Uuid,
    servers: Vec<IngestServer>,
    state: IngestTestState,
    current: usize,
    servers_completed: usize,
    server_progress: f32,
    connector: Box<dyn IngestConnector>,
    measurement: Option<MeasurementHandle>,
    observers: Observers<IngestEvent>,
}

impl fmt::Debug for IngestProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestProbe")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current", &self.current)
            .field("servers_completed", &self.servers_completed)
            .field("server_progress", &self.server_progress)
            .finish()
    }
}

impl IngestProbe {
    pub fn new(
        list: &IngestList,
        connector: Box<dyn IngestConnector>,
        observers: Observers<IngestEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            servers: list.servers().to_vec(),
            state: IngestTestState::Idle,
            current: 0,
            servers_completed: 0,
            server_progress: 0.0,
            connector,
            measurement: None,
            observers,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> IngestTestState {
        self.state
    }

    /// Servers with the bitrates measured so far
    pub fn servers(&self) -> &[IngestServer] {
        &self.servers
    }

    /// Server under test; `None` before start and after the probe ends
    pub fn current_server(&self) -> Option<&IngestServer> {
        match self.state {
            IngestTestState::Idle | IngestTestState::Finished | IngestTestState::Cancelled => None,
            _ => self.servers.get(self.current),
        }
    }

    pub fn servers_completed(&self) -> usize {
        self.servers_completed
    }

    pub fn server_progress(&self) -> f32 {
        self.server_progress
    }

    /// `(serversCompleted + serverProgress) / totalServers`, within `[0, 1]`
    pub fn total_progress(&self) -> f32 {
        if self.servers.is_empty() {
            return if self.state == IngestTestState::Finished { 1.0 } else { 0.0 };
        }
        let total = (self.servers_completed as f32 + self.server_progress) / self.servers.len() as f32;
        total.clamp(0.0, 1.0)
    }

    pub fn progress(&self) -> IngestProgress {
        let current = self.current_server();
        IngestProgress {
            state: self.state,
            server_index: current.map(|_| self.current),
            server_name: current.map(|s| s.name.clone()),
            server_bitrate_kbps: current.map(|s| s.bitrate_kbps).unwrap_or(0.0),
            servers_completed: self.servers_completed,
            total_servers: self.servers.len(),
            server_progress: self.server_progress,
            total_progress: self.total_progress(),
        }
    }

    /// Begin with the first server
    pub fn start(&mut self) -> Result<(), IngestError> {
        if self.state != IngestTestState::Idle {
            return Err(IngestError::AlreadyStarted(self.state));
        }

        info!(
            "📡 {}: probe {} over {} servers",
            "INGEST_TEST_START".green(),
            self.id,
            self.servers.len()
        );

        if self.servers.is_empty() {
            self.enter(IngestTestState::Finished);
            return Ok(());
        }

        self.current = 0;
        self.begin_connect();
        Ok(())
    }

    /// Advance one step from the latest measurement state. Returns the resulting state.
    pub fn advance(&mut self) -> IngestTestState {
        match self.state {
            IngestTestState::Idle | IngestTestState::Finished | IngestTestState::Cancelled => {}
            IngestTestState::ConnectingToServer => match self.measurement.as_ref().map(|m| m.phase()) {
                Some(MeasurementPhase::Connecting) => {}
                Some(MeasurementPhase::Measuring) | Some(MeasurementPhase::Complete) => {
                    self.server_progress = 0.0;
                    self.enter(IngestTestState::TestingServer);
                }
                Some(MeasurementPhase::Failed) | None => {
                    warn!(
                        "⚠️ {}: connection to {} failed",
                        "INGEST_SERVER_FAILED".yellow(),
                        self.servers[self.current].name
                    );
                    self.finish_server();
                }
            },
            IngestTestState::TestingServer => self.step_measurement(),
            IngestTestState::DoneTestingServer => self.next_server(),
        }
        self.state
    }

    /// End the current server early, keeping whatever bitrate was measured.
    pub fn skip_current_server(&mut self) -> Result<IngestTestState, IngestError> {
        match self.state {
            IngestTestState::ConnectingToServer | IngestTestState::TestingServer => {
                info!(
                    "⏭️ {}: skipping {}",
                    "INGEST_SKIP".blue(),
                    self.servers[self.current].name
                );
                self.finish_server();
                self.next_server();
                Ok(self.state)
            }
            other => Err(IngestError::InvalidState(other)),
        }
    }

    /// Stop the probe; terminal.
    pub fn cancel(&mut self) -> Result<(), IngestError> {
        if self.state.is_terminal() {
            return Err(IngestError::InvalidState(self.state));
        }
        self.release_measurement();
        info!(
            "🛑 {}: probe {} cancelled at {:.0}%",
            "INGEST_TEST_CANCEL".red(),
            self.id,
            self.total_progress() * 100.0
        );
        self.enter(IngestTestState::Cancelled);
        Ok(())
    }

    fn step_measurement(&mut self) {
        let Some(measurement) = self.measurement.as_ref() else {
            self.finish_server();
            return;
        };

        let phase = measurement.phase();
        let reported = measurement.progress();
        self.servers[self.current].bitrate_kbps = measurement.bitrate_kbps();

        if phase.is_finished() {
            if phase == MeasurementPhase::Failed {
                warn!(
                    "⚠️ {}: measurement against {} failed at {:.0}%",
                    "INGEST_SERVER_FAILED".yellow(),
                    self.servers[self.current].name,
                    self.server_progress * 100.0
                );
            }
            self.finish_server();
        } else if reported > self.server_progress {
            // Progress only moves forward within one server
            self.server_progress = reported.min(1.0);
            self.enter(IngestTestState::TestingServer);
        }
    }

    fn begin_connect(&mut self) {
        self.server_progress = 0.0;
        self.enter(IngestTestState::ConnectingToServer);

        let server = self.servers[self.current].clone();
        match self.connector.connect(&server) {
            Ok(handle) => self.measurement = Some(handle),
            Err(e) => {
                warn!("⚠️ {}: {}", "INGEST_CONNECT_FAILED".yellow(), e);
                self.servers[self.current].bitrate_kbps = 0.0;
                self.finish_server();
            }
        }
    }

    fn finish_server(&mut self) {
        if let Some(measurement) = self.measurement.as_ref() {
            self.servers[self.current].bitrate_kbps = measurement.bitrate_kbps();
        }
        self.release_measurement();
        self.servers_completed += 1;
        self.server_progress = 0.0;

        info!(
            "✅ {}: {} measured at {:.0} kbps ({}/{})",
            "INGEST_SERVER_DONE".green(),
            self.servers[self.current].name,
            self.servers[self.current].bitrate_kbps,
            self.servers_completed,
            self.servers.len()
        );
        self.enter(IngestTestState::DoneTestingServer);
    }

    fn next_server(&mut self) {
        if self.current + 1 < self.servers.len() {
            self.current += 1;
            self.begin_connect();
        } else {
            info!(
                "🏁 {}: probe {} finished",
                "INGEST_TEST_FINISHED".green(),
                self.id
            );
            self.enter(IngestTestState::Finished);
        }
    }

    fn release_measurement(&mut self) {
        if let Some(measurement) = self.measurement.take() {
            measurement.abort();
            let server = self.servers[self.current].clone();
            self.connector.disconnect(&server);
        }
    }

    fn enter(&mut self, state: IngestTestState) {
        self.state = state;
        self.observers.emit(&IngestEvent::new(self.id, self.progress()));
    }
}

impl Drop for IngestProbe {
    fn drop(&mut self) {
        self.release_measurement();
    }
}
