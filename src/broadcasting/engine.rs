// Boundary to the network broadcast engine
//
// Encoding, transport and authentication live behind `BroadcastEngine`. The
// orchestrator only reacts to the success or failure of each call.

use std::fmt;

use super::ingest::{IngestConnector, IngestList, IngestServer};
use super::types::{ArchivingState, BroadcastError, BroadcastSettings, Metadata, SpanId, StreamInfo};

/// Account details handed to the engine at initialization
#[derive(Clone, Default)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    /// Previously issued token; when present no password login is needed
    pub auth_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Client id and username are required; a secret or a token must be present.
    pub fn validate(&self) -> Result<(), BroadcastError> {
        if self.client_id.trim().is_empty() {
            return Err(BroadcastError::InvalidCredentials("client id is empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(BroadcastError::InvalidCredentials("username is empty".to_string()));
        }
        let has_token = self.auth_token.as_deref().map(|t| !t.is_empty()).unwrap_or(false);
        if self.client_secret.is_empty() && !has_token {
            return Err(BroadcastError::InvalidCredentials(
                "either a client secret or an auth token is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    Initialization(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error("Engine rejected {command}: {reason}")]
    Rejected {
        command: &'static str,
        reason: String,
    },

    #[error("Engine disconnected: {0}")]
    Disconnected(String),

    #[error("Engine does not support {0}")]
    Unsupported(&'static str),
}

/// Network engine operations the orchestrator drives.
///
/// Calls are made from the control loop only, never concurrently.
pub trait BroadcastEngine: Send {
    /// Initialize and log in
    fn initialize(&mut self, credentials: &Credentials) -> Result<(), EngineError>;

    /// Server directory; available once initialization has succeeded
    fn ingest_list(&mut self) -> Option<IngestList>;

    fn select_ingest_server(&mut self, server: &IngestServer) -> Result<(), EngineError>;

    fn start_broadcast(&mut self, settings: &BroadcastSettings) -> Result<(), EngineError>;

    fn pause_broadcast(&mut self) -> Result<(), EngineError>;

    fn resume_broadcast(&mut self) -> Result<(), EngineError>;

    fn stop_broadcast(&mut self) -> Result<(), EngineError>;

    /// Connector used by a new ingest probe
    fn ingest_connector(&mut self) -> Box<dyn IngestConnector>;

    /// Periodic housekeeping. An error while live means the broadcast ended on its own.
    fn update(&mut self) -> Result<(), EngineError>;

    fn shutdown(&mut self);

    fn run_commercial(&mut self) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("commercials"))
    }

    fn send_action_metadata(&mut self, _action: &Metadata) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("action metadata"))
    }

    /// Open a span; the returned id closes it
    fn start_span_metadata(&mut self, _span: &Metadata) -> Result<SpanId, EngineError> {
        Err(EngineError::Unsupported("span metadata"))
    }

    fn end_span_metadata(&mut self, _span: SpanId, _end: &Metadata) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("span metadata"))
    }

    /// Levels are already clamped to `[0, 1]`
    fn set_microphone_volume(&mut self, _volume: f32) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("microphone volume"))
    }

    fn set_system_volume(&mut self, _volume: f32) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("system volume"))
    }

    /// Game names matching `query`
    fn game_name_list(&mut self, _query: &str) -> Result<Vec<String>, EngineError> {
        Err(EngineError::Unsupported("game name lookup"))
    }

    fn set_stream_info(&mut self, _info: &StreamInfo) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("stream info"))
    }

    /// Latest archiving state, read once per poll; `None` when unknown
    fn archiving_state(&mut self) -> Option<ArchivingState> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_validation() {
        assert!(Credentials::new("id", "secret", "user").validate().is_ok());
        assert!(Credentials::new("id", "", "user")
            .with_auth_token("token")
            .validate()
            .is_ok());
        assert!(Credentials::new("", "secret", "user").validate().is_err());
        assert!(Credentials::new("id", "secret", "  ").validate().is_err());
        assert!(matches!(
            Credentials::new("id", "", "user").validate(),
            Err(BroadcastError::InvalidCredentials(_))
        ));
    }

    struct BareEngine;

    impl BroadcastEngine for BareEngine {
        fn initialize(&mut self, _credentials: &Credentials) -> Result<(), EngineError> {
            Ok(())
        }
        fn ingest_list(&mut self) -> Option<IngestList> {
            None
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
            unimplemented!("not probed")
        }
        fn update(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
        fn shutdown(&mut self) {}
    }

    #[test]
    fn test_optional_capabilities_default_to_unsupported() {
        let mut engine = BareEngine;
        assert_eq!(engine.run_commercial(), Err(EngineError::Unsupported("commercials")));
        assert!(matches!(
            engine.set_microphone_volume(0.5),
            Err(EngineError::Unsupported(_))
        ));
        assert!(matches!(
            engine.game_name_list("chess"),
            Err(EngineError::Unsupported(_))
        ));
        assert_eq!(engine.archiving_state(), None);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = Credentials::new("id", "hunter2", "user").with_auth_token("tok-123");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("tok-123"));
        assert!(rendered.contains("user"));
    }
}
