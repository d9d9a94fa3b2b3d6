//! Inference engine facade.
//!
//! The raw speech-to-text engine is an external collaborator: given an
//! audio file it yields text segments with unit-local timestamps. This
//! module owns the seam ([`InferenceEngine`]), the subprocess-backed
//! implementation that drives an engine binary, and the model catalogue.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use subtext_common::ipc::ModelInfo;
use subtext_common::types::{ModelKey, Task, TextSegment};

/// What went wrong inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The model could not be loaded.
    Load,
    /// A transcription call failed for an ordinary reason.
    Inference,
    /// The device ran out of memory.
    OutOfMemory,
    /// The device could not be initialised at all.
    DeviceInit,
}

/// Error type for engine operations.
#[derive(Debug)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Fatal errors poison the hosting worker: it must be respawned
    /// rather than handed further units.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::OutOfMemory | EngineErrorKind::DeviceInit
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            EngineErrorKind::Load => write!(f, "Model load failed: {}", self.message),
            EngineErrorKind::Inference => write!(f, "Inference failed: {}", self.message),
            EngineErrorKind::OutOfMemory => write!(f, "Device out of memory: {}", self.message),
            EngineErrorKind::DeviceInit => {
                write!(f, "Device initialisation failed: {}", self.message)
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// The engine contract: load once, then one transcription call at a
/// time. No assumption is made about thread safety; callers serialise.
pub trait InferenceEngine: Send + 'static {
    /// Load the model. Called exactly once per engine lifetime, before
    /// any transcription.
    fn load(&mut self) -> Result<(), EngineError>;

    /// Transcribe one audio file, returning segments in file-local time.
    fn transcribe(
        &mut self,
        wav_path: &Path,
        language: Option<&str>,
        task: Task,
        prompt: Option<&str>,
    ) -> Result<Vec<TextSegment>, EngineError>;
}

/// Segment shape the engine binary emits on stdout (one JSON object per
/// line).
#[derive(Debug, Deserialize)]
struct EngineSegment {
    start: f64,
    end: f64,
    text: String,
}

/// Engine implementation driving an external inference binary.
///
/// The binary owns model residency; this facade guarantees the one-load
/// contract and classifies its failures. Invocation shape:
/// `<bin> --model M --precision P [--language L] --task T [--prompt S]
/// --output json <wav>`.
pub struct CommandEngine {
    binary: PathBuf,
    key: ModelKey,
    loaded: bool,
}

impl CommandEngine {
    pub fn new(binary: impl Into<PathBuf>, key: ModelKey) -> Self {
        Self {
            binary: binary.into(),
            key,
            loaded: false,
        }
    }

    /// Classify an engine failure from its stderr.
    fn classify(stderr: &str) -> EngineErrorKind {
        let lower = stderr.to_lowercase();
        if lower.contains("out of memory") || lower.contains("oom") {
            EngineErrorKind::OutOfMemory
        } else if lower.contains("no device")
            || lower.contains("device init")
            || lower.contains("cuda driver")
        {
            EngineErrorKind::DeviceInit
        } else {
            EngineErrorKind::Inference
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--model", &self.key.model])
            .args(["--precision", self.key.precision.as_str()]);
        cmd
    }
}

impl InferenceEngine for CommandEngine {
    fn load(&mut self) -> Result<(), EngineError> {
        if self.loaded {
            return Ok(());
        }

        debug!("Loading model {} via {}", self.key, self.binary.display());
        let output = self
            .base_command()
            .arg("--load-only")
            .output()
            .map_err(|e| {
                EngineError::new(
                    EngineErrorKind::Load,
                    format!("failed to run {}: {}", self.binary.display(), e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let kind = match Self::classify(&stderr) {
                EngineErrorKind::Inference => EngineErrorKind::Load,
                fatal => fatal,
            };
            return Err(EngineError::new(kind, stderr.trim().to_string()));
        }

        self.loaded = true;
        Ok(())
    }

    fn transcribe(
        &mut self,
        wav_path: &Path,
        language: Option<&str>,
        task: Task,
        prompt: Option<&str>,
    ) -> Result<Vec<TextSegment>, EngineError> {
        let mut cmd = self.base_command();
        if let Some(lang) = language {
            cmd.args(["--language", lang]);
        }
        cmd.args(["--task", task.as_str()]);
        if let Some(prompt) = prompt {
            cmd.args(["--prompt", prompt]);
        }
        cmd.args(["--output", "json"]).arg(wav_path);

        let output = cmd.output().map_err(|e| {
            EngineError::new(
                EngineErrorKind::Inference,
                format!("failed to run {}: {}", self.binary.display(), e),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::new(
                Self::classify(&stderr),
                stderr.trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut segments = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let seg: EngineSegment = serde_json::from_str(line).map_err(|e| {
                EngineError::new(
                    EngineErrorKind::Inference,
                    format!("bad engine output line {:?}: {}", line, e),
                )
            })?;
            segments.push(TextSegment::new(seg.start, seg.end, seg.text));
        }

        Ok(segments)
    }
}

/// Known model variants with display labels.
pub fn model_catalog() -> Vec<ModelInfo> {
    const MODELS: &[(&str, &str)] = &[
        ("large-v3", "General"),
        ("large-v3-turbo", "General"),
        ("formospeech/whisper-large-v2-taiwanese-hakka-v1", "Hakka"),
    ];

    MODELS
        .iter()
        .map(|(id, label)| ModelInfo {
            id: id.to_string(),
            label: label.to_string(),
            display_name: format!("[{}] {}", label, id),
        })
        .collect()
}

/// Test doubles shared by scheduler, pool and pipeline tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Engine returning a fixed segment list, counting loads and calls.
    pub struct FakeEngine {
        pub loads: Arc<AtomicUsize>,
        pub calls: Arc<AtomicUsize>,
        pub segments: Vec<TextSegment>,
    }

    impl FakeEngine {
        pub fn new(segments: Vec<TextSegment>) -> Self {
            Self {
                loads: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
                segments,
            }
        }
    }

    impl InferenceEngine for FakeEngine {
        fn load(&mut self) -> Result<(), EngineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn transcribe(
            &mut self,
            _wav_path: &Path,
            _language: Option<&str>,
            _task: Task,
            _prompt: Option<&str>,
        ) -> Result<Vec<TextSegment>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.segments.clone())
        }
    }

    /// Engine that fails the first `failures` calls, then succeeds.
    pub struct FlakyEngine {
        pub remaining_failures: usize,
        pub kind: EngineErrorKind,
        pub segments: Vec<TextSegment>,
    }

    impl InferenceEngine for FlakyEngine {
        fn load(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn transcribe(
            &mut self,
            _wav_path: &Path,
            _language: Option<&str>,
            _task: Task,
            _prompt: Option<&str>,
        ) -> Result<Vec<TextSegment>, EngineError> {
            if self.remaining_failures > 0 {
                self.remaining_failures -= 1;
                return Err(EngineError::new(self.kind, "injected failure"));
            }
            Ok(self.segments.clone())
        }
    }
}
