//! IPC request types.

use serde::{Deserialize, Serialize};

use crate::types::{Precision, Task, TranscribeRequest};

/// IPC request from client to service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Run a transcription end to end and return the subtitle outcome.
    Transcribe { request: TranscribeRequest },
    /// Query service status (admission load, cached engines).
    Status,
    /// List the model catalogue.
    ListModels,
}

impl Request {
    /// Validate request parameters before any handler runs.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Transcribe { request } => request.validate(),
            Request::Status | Request::ListModels => Ok(()),
        }
    }
}

/// Command from the supervisor to a worker process, framed over the
/// child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Handshake: load the model for the given key. Sent exactly once,
    /// first. The device restriction is already applied through the
    /// child's environment.
    Init {
        worker_id: usize,
        device: u32,
        model: String,
        precision: Precision,
        /// Inference engine binary the worker should drive.
        engine_bin: String,
    },
    /// Transcribe one unit. The WAV at `wav_path` holds the unit's
    /// slice; `region_start_s` is the offset used to rebase segment
    /// times to the global timeline.
    Transcribe {
        unit_id: u64,
        wav_path: String,
        region_start_s: f64,
        duration_s: f64,
        #[serde(default)]
        language: Option<String>,
        task: Task,
        #[serde(default)]
        prompt: Option<String>,
    },
    /// Drain and exit.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcribe_request_validation_propagates() {
        let mut inner = TranscribeRequest::new("clip.wav");
        inner.max_chars = 7;
        let req = Request::Transcribe { request: inner };
        assert!(req.validate().is_err());
    }

    #[test]
    fn worker_command_tagged_encoding() {
        let cmd = WorkerCommand::Shutdown;
        assert_eq!(
            serde_json::to_string(&cmd).unwrap(),
            r#"{"type":"shutdown"}"#
        );
    }

    #[test]
    fn worker_transcribe_roundtrip() {
        let cmd = WorkerCommand::Transcribe {
            unit_id: 3,
            wav_path: "/tmp/unit-3.wav".into(),
            region_start_s: 42.5,
            duration_s: 18.0,
            language: Some("zh".into()),
            task: Task::Transcribe,
            prompt: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: WorkerCommand = serde_json::from_str(&json).unwrap();
        match back {
            WorkerCommand::Transcribe {
                unit_id,
                region_start_s,
                ..
            } => {
                assert_eq!(unit_id, 3);
                assert_eq!(region_start_s, 42.5);
            }
            _ => panic!("wrong variant"),
        }
    }
}
