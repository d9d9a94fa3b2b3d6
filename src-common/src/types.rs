//! Shared data model for the subtext transcription pipeline.

use serde::{Deserialize, Serialize};

/// Sample rate every component operates at. Audio is normalised to this
/// rate at load time; all sample indices downstream assume it.
pub const SAMPLE_RATE: u32 = 16_000;

/// A half-open speech interval `[start_s, end_s)` in audio seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeechRegion {
    pub start_s: f64,
    pub end_s: f64,
}

impl SpeechRegion {
    pub fn new(start_s: f64, end_s: f64) -> Self {
        Self { start_s, end_s }
    }

    /// Region duration in seconds.
    pub fn duration_s(&self) -> f64 {
        self.end_s - self.start_s
    }
}

/// One transcribed span of text with absolute timestamps.
///
/// Workers produce these in unit-local time and rebase them to absolute
/// audio time before returning, so everything downstream of a worker can
/// treat `start_s`/`end_s` as global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSegment {
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
}

impl TextSegment {
    pub fn new(start_s: f64, end_s: f64, text: impl Into<String>) -> Self {
        Self {
            start_s,
            end_s,
            text: text.into(),
        }
    }

    /// Shift both timestamps by `offset_s` (unit-local to absolute time).
    pub fn rebased(mut self, offset_s: f64) -> Self {
        self.start_s += offset_s;
        self.end_s += offset_s;
        self
    }
}

/// Outcome status of one work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Transcribed normally (segments may still be empty).
    Ok,
    /// Too short to transcribe; empty segments, not a failure.
    Skipped,
    /// Engine raised; `error` carries the reason.
    Failed,
}

/// Per-unit result returned by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: u64,
    pub status: UnitStatus,
    #[serde(default)]
    pub segments: Vec<TextSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub worker_id: usize,
    pub elapsed_s: f64,
}

impl UnitResult {
    pub fn skipped(unit_id: u64, worker_id: usize) -> Self {
        Self {
            unit_id,
            status: UnitStatus::Skipped,
            segments: Vec::new(),
            error: None,
            worker_id,
            elapsed_s: 0.0,
        }
    }

    pub fn failed(unit_id: u64, worker_id: usize, error: impl Into<String>, elapsed_s: f64) -> Self {
        Self {
            unit_id,
            status: UnitStatus::Failed,
            segments: Vec::new(),
            error: Some(error.into()),
            worker_id,
            elapsed_s,
        }
    }
}

/// Numeric precision the inference engine runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float16,
    /// Roughly halves device memory relative to float16.
    Int8,
    Float32,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Float16 => "float16",
            Precision::Int8 => "int8",
            Precision::Float32 => "float32",
        }
    }

    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "float16" | "fp16" => Some(Precision::Float16),
            "int8" => Some(Precision::Int8),
            "float32" | "fp32" => Some(Precision::Float32),
            _ => None,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine is asked to do with the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    /// Translate to English while transcribing.
    Translate,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Transcribe => "transcribe",
            Task::Translate => "translate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "transcribe" => Some(Task::Transcribe),
            "translate" => Some(Task::Translate),
            _ => None,
        }
    }
}

/// Identity of a loaded model: a worker only serves units whose engine
/// requested the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub model: String,
    pub precision: Precision,
}

impl ModelKey {
    pub fn new(model: impl Into<String>, precision: Precision) -> Self {
        Self {
            model: model.into(),
            precision,
        }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.model, self.precision)
    }
}

/// Execution mode of a transcription engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// One in-process engine on a single device.
    Single,
    /// One worker process per device.
    Parallel,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineMode::Single => f.write_str("single"),
            EngineMode::Parallel => f.write_str("parallel"),
        }
    }
}

/// Lifecycle state of one pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Draining,
    Dead,
}

/// A transcription request as accepted over the request surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeRequest {
    /// Local file path or remote media URL.
    pub source: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub precision: Precision,
    /// `None` means auto-detect.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Task,
    #[serde(default = "default_true")]
    pub use_vad: bool,
    /// Minimum silence (seconds) required to split speech regions.
    #[serde(default = "default_min_silence")]
    pub min_silence_s: f64,
    #[serde(default = "default_true")]
    pub merge: bool,
    /// Per-line length cap for merged subtitles.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default)]
    pub parallel: bool,
    /// Convert Simplified to Traditional script for Chinese output.
    #[serde(default)]
    pub convert_script: bool,
}

fn default_model() -> String {
    "large-v3-turbo".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_silence() -> f64 {
    0.1
}

fn default_max_chars() -> usize {
    80
}

impl TranscribeRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            model: default_model(),
            precision: Precision::default(),
            language: None,
            task: Task::default(),
            use_vad: true,
            min_silence_s: default_min_silence(),
            merge: true,
            max_chars: default_max_chars(),
            parallel: false,
            convert_script: false,
        }
    }

    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(self.model.clone(), self.precision)
    }

    /// Validate parameter ranges before any resources are committed.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("source must not be empty".to_string());
        }
        if !(0.01..=2.0).contains(&self.min_silence_s) {
            return Err(format!(
                "min_silence_s must be in [0.01, 2.0], got {}",
                self.min_silence_s
            ));
        }
        if !(40..=120).contains(&self.max_chars) {
            return Err(format!(
                "max_chars must be in [40, 120], got {}",
                self.max_chars
            ));
        }
        Ok(())
    }
}

/// Final result handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeOutcome {
    /// Rendered SRT content.
    pub subtitles: String,
    /// Path of the persisted `.srt` artefact, if one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitles_path: Option<String>,
    /// Number of subtitle records after post-processing.
    pub segment_count: usize,
    /// Units that terminally failed (empty output substituted).
    pub failed_units: usize,
    /// Units skipped as too short.
    pub skipped_units: usize,
    /// Human-readable warnings accumulated along the way.
    #[serde(default)]
    pub warnings: Vec<String>,
    pub audio_duration_s: f64,
    pub elapsed_s: f64,
}
