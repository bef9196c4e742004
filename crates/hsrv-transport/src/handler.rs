//! Connection handler - the per-session protocol state machine
//!
//! The handler is pure: it takes one line at a time and says what to write
//! back and whether the session is over. The I/O loop lives in `tcp.rs`.

use std::sync::Arc;

use hsrv_core::{Corpus, ALGORITHM};
use hsrv_protocol::{parse_line, Command, CommandKind, Generation, ProtocolVersion, Response};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::TransportError;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingVersion,
    Active(Generation),
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Client sent BYE
    Bye,
    /// Generation 1 transaction answered
    Completed,
    /// Bad version, unknown command or malformed digest
    Refused,
    Timeout,
    PeerClosed,
    BufferOverflow,
    TransportError,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Bye => "bye",
            EndReason::Completed => "completed",
            EndReason::Refused => "refused",
            EndReason::Timeout => "timeout",
            EndReason::PeerClosed => "peer_closed",
            EndReason::BufferOverflow => "buffer_overflow",
            EndReason::TransportError => "transport_error",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&TransportError> for EndReason {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => EndReason::Timeout,
            TransportError::ConnectionClosed => EndReason::PeerClosed,
            TransportError::BufferOverflow { .. } => EndReason::BufferOverflow,
            TransportError::Io(_) => EndReason::TransportError,
        }
    }
}

/// Outcome of handling one line
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Command that was recognized, if any
    pub command: Option<CommandKind>,
    /// Line to write back
    pub response: Option<Response>,
    /// Set when the session ends after the response is written
    pub close: Option<EndReason>,
}

impl Step {
    fn reply(command: CommandKind, response: Response) -> Self {
        Self {
            command: Some(command),
            response: Some(response),
            close: None,
        }
    }

    fn refuse(command: Option<CommandKind>) -> Self {
        Self {
            command,
            response: Some(Response::not_ok()),
            close: Some(EndReason::Refused),
        }
    }

    fn closing(mut self, reason: EndReason) -> Self {
        self.close = Some(reason);
        self
    }
}

/// Handles a single client session
pub struct ConnectionHandler {
    /// Unique client ID
    pub client_id: String,
    /// Shared, read-only corpus
    corpus: Arc<Corpus>,
    config: ServerConfig,
    state: SessionState,
    /// Generation in force when the session ended or last negotiated
    generation: Option<Generation>,
    queried: u64,
    found: u64,
}

impl ConnectionHandler {
    pub fn new(client_id: String, corpus: Arc<Corpus>, config: ServerConfig) -> Self {
        Self {
            client_id,
            corpus,
            config,
            state: SessionState::AwaitingVersion,
            generation: None,
            queried: 0,
            found: 0,
        }
    }

    /// Handle one received line. Blank lines return `None`.
    pub fn handle_line(&mut self, line: &str) -> Option<Step> {
        if self.state == SessionState::Closed {
            return Some(Step::refuse(None));
        }

        let command = match parse_line(line) {
            Ok(Some(command)) => command,
            Ok(None) => return None,
            Err(e) => {
                debug!(client = %self.client_id, error = %e, "Refusing line");
                return Some(Step::refuse(None));
            }
        };
        debug!(client = %self.client_id, cmd = ?command.kind(), "Processing command");

        let step = match self.state {
            SessionState::AwaitingVersion => self.handle_greeting(command),
            SessionState::Active(generation) => self.handle_command(generation, command),
            SessionState::Closed => Step::refuse(None),
        };
        Some(step)
    }

    fn handle_greeting(&mut self, command: Command) -> Step {
        match command {
            Command::Version(version) => match self.negotiate(version) {
                Some(_) => Step::reply(CommandKind::Version, Response::ok()),
                None => Step::refuse(Some(CommandKind::Version)),
            },
            other => Step::refuse(Some(other.kind())),
        }
    }

    fn handle_command(&mut self, generation: Generation, command: Command) -> Step {
        let kind = command.kind();
        if !generation.accepts(kind) {
            return Step::refuse(Some(kind));
        }

        let step = match command {
            Command::Version(version) => match self.negotiate(version) {
                Some(_) => Step::reply(kind, Response::ok()),
                None => return Step::refuse(Some(kind)),
            },
            Command::Query(keys) => self.handle_query(&keys),
            Command::Bye => Step {
                command: Some(kind),
                response: None,
                close: Some(EndReason::Bye),
            },
            Command::Status => self.handle_status(),
            Command::Upshift => Step::reply(kind, Response::not_ok()),
            Command::Downshift => {
                self.enter(Generation::Protocol1);
                Step::reply(kind, Response::ok())
            }
        };

        if generation.is_single_shot() && step.close.is_none() {
            step.closing(EndReason::Completed)
        } else {
            step
        }
    }

    fn negotiate(&mut self, version: ProtocolVersion) -> Option<Generation> {
        let generation = version.generation(self.config.old_protocol_only);
        match generation {
            Some(generation) => {
                debug!(client = %self.client_id, version = %version, generation = %generation, "Version accepted");
                self.enter(generation);
            }
            None => {
                info!(client = %self.client_id, version = %version, "Unsupported protocol version");
            }
        }
        generation
    }

    fn enter(&mut self, generation: Generation) {
        self.state = SessionState::Active(generation);
        self.generation = Some(generation);
    }

    fn handle_query(&mut self, keys: &[hsrv_core::BinaryKey]) -> Step {
        let mut bits = String::with_capacity(keys.len());
        for key in keys {
            let hit = self.corpus.contains(key);
            if hit {
                self.found += 1;
            }
            bits.push(if hit { '1' } else { '0' });
        }
        self.queried += keys.len() as u64;

        Step::reply(CommandKind::Query, Response::Query(bits))
    }

    fn handle_status(&self) -> Step {
        if !self.config.status_enabled {
            info!(client = %self.client_id, "Status requested, reporting disabled");
            return Step::reply(CommandKind::Status, Response::not_supported());
        }

        let load = system_load();
        info!(
            client = %self.client_id,
            hashes = self.corpus.len(),
            algorithm = ALGORITHM,
            load_1 = load[0],
            load_5 = load[1],
            load_15 = load[2],
            "Status requested"
        );
        Step::reply(
            CommandKind::Status,
            Response::status(self.corpus.len(), ALGORITHM, load),
        )
    }

    /// Close the session and log its summary. Only the first call logs.
    pub fn finish(&mut self, reason: EndReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        info!(
            client = %self.client_id,
            found = self.found,
            queried = self.queried,
            generation = self.generation.map(|g| g.number()).unwrap_or(0),
            reason = %reason,
            "Session ended"
        );
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> Option<Generation> {
        self.generation
    }

    /// Digests looked up so far
    pub fn queried(&self) -> u64 {
        self.queried
    }

    /// Digests found so far
    pub fn found(&self) -> u64 {
        self.found
    }
}

/// 1, 5 and 15 minute load averages; zeros where unavailable
fn system_load() -> [f64; 3] {
    let mut load = [0.0; 3];
    if let Ok(text) = std::fs::read_to_string("/proc/loadavg") {
        for (slot, field) in load.iter_mut().zip(text.split_whitespace()) {
            *slot = field.parse().unwrap_or(0.0);
        }
    }
    load
}
