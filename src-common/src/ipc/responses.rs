//! IPC response types.

use serde::{Deserialize, Serialize};

use crate::types::{TranscribeOutcome, UnitResult};

/// One entry of the model catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Identifier accepted in requests (e.g. `large-v3-turbo`).
    pub id: String,
    /// Short grouping label (e.g. `General`).
    pub label: String,
    /// Human-readable name for listings.
    pub display_name: String,
}

/// Service status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Sessions currently holding an admission slot.
    pub active_sessions: usize,
    /// Admission ceiling.
    pub max_sessions: usize,
    /// Engine cache keys currently resident, as display strings.
    pub cached_engines: Vec<String>,
    pub version: String,
}

/// IPC response from service to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Transcription finished (possibly with warnings).
    Outcome { outcome: TranscribeOutcome },
    /// Current service status.
    Status { status: ServiceStatus },
    /// Model catalogue.
    Models { models: Vec<ModelInfo> },
    /// Request failed.
    Error { message: String },
}

impl Response {
    /// Build an error response from anything displayable.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

/// Reply from a worker process to its supervisor, framed over the
/// child's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Model loaded; the worker accepts units.
    Ready { worker_id: usize },
    /// Result for one unit. `fatal` marks device exhaustion or device
    /// initialisation failure: the worker is unusable afterwards and
    /// the supervisor should respawn it.
    Unit { result: UnitResult, fatal: bool },
    /// The worker could not initialise at all.
    Error { message: String, fatal: bool },
}
