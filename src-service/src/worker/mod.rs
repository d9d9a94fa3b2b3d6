//! Inference workers: the execution contexts that hold resident models
//! and transcribe work units one at a time.
//!
//! Two flavours implement the same contract: [`link::ProcessWorker`]
//! supervises a `subtext-worker` child process pinned to one device
//! (parallel mode), and [`InProcessWorker`] hosts the engine directly
//! (single mode). Either way: one device, one model, one in-flight unit.

pub mod link;
pub mod pool;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Instant;

use tracing::warn;

use crate::engine::InferenceEngine;
use crate::partition::WorkUnit;
use subtext_common::types::{Task, UnitResult, SAMPLE_RATE};

pub type WorkerId = usize;

/// Boxed future, the object-safe shape for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Units shorter than this are skipped outright: the engine produces
/// nothing useful and the dispatch overhead is pure waste.
pub const MIN_UNIT_DURATION_S: f64 = 0.1;

/// Error type for worker operations. Any of these means the worker can
/// no longer be trusted with units; unit-level engine failures travel
/// inside [`UnitResult`] instead.
#[derive(Debug)]
pub enum WorkerError {
    /// The worker failed to spawn or initialise its device/model.
    Spawn(String),
    /// The communication link broke (process died, pipe closed).
    Link(String),
    /// The engine reported device exhaustion or device-init failure;
    /// the worker must be respawned.
    Fatal(String),
    /// The worker is dead and its respawn budget is spent.
    Dead,
    /// Local I/O while staging unit audio.
    Io(std::io::Error),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Spawn(msg) => write!(f, "Worker spawn failed: {}", msg),
            WorkerError::Link(msg) => write!(f, "Worker link failed: {}", msg),
            WorkerError::Fatal(msg) => write!(f, "Worker poisoned: {}", msg),
            WorkerError::Dead => write!(f, "Worker is dead"),
            WorkerError::Io(e) => write!(f, "Worker I/O error: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError::Io(e)
    }
}

/// Per-session constants every unit of a run shares.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Directory for staged unit audio, inside the session workdir.
    pub units_dir: PathBuf,
    pub language: Option<String>,
    pub task: Task,
    pub prompt: Option<String>,
}

/// The per-unit contract every worker flavour implements.
///
/// `transcribe` takes `&mut self`: a worker holds exactly one in-flight
/// unit, enforced by the borrow. A returned [`WorkerError`] poisons the
/// worker; the scheduler requeues the unit and asks the pool for a
/// respawn.
pub trait UnitWorker: Send {
    fn id(&self) -> WorkerId;

    fn transcribe<'a>(
        &'a mut self,
        unit: &'a WorkUnit,
        ctx: &'a JobContext,
    ) -> BoxFuture<'a, Result<UnitResult, WorkerError>>;

    /// Drain and release the worker's resources.
    fn shutdown(&mut self) -> BoxFuture<'_, ()>;
}

/// Staged unit audio that is removed again on every exit path.
pub struct TempWav {
    path: PathBuf,
}

impl TempWav {
    /// Write the unit's samples as 16-bit PCM into `dir`.
    pub fn write(dir: &Path, unit: &WorkUnit) -> Result<Self, WorkerError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("unit-{}.wav", unit.unit_id));

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| WorkerError::Io(std::io::Error::other(e.to_string())))?;
        for &s in unit.samples() {
            let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer
                .write_sample(v)
                .map_err(|e| WorkerError::Io(std::io::Error::other(e.to_string())))?;
        }
        writer
            .finalize()
            .map_err(|e| WorkerError::Io(std::io::Error::other(e.to_string())))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempWav {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staged unit {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Single-mode worker: hosts the resident engine in-process and drives
/// it with the same per-unit contract as the process workers.
pub struct InProcessWorker {
    id: WorkerId,
    engine: Option<Box<dyn InferenceEngine>>,
}

impl InProcessWorker {
    /// Build the worker and load the model (the one load of this
    /// worker's lifetime).
    pub fn start(id: WorkerId, mut engine: Box<dyn InferenceEngine>) -> Result<Self, WorkerError> {
        engine
            .load()
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        Ok(Self {
            id,
            engine: Some(engine),
        })
    }

    async fn run_unit(
        &mut self,
        unit: &WorkUnit,
        ctx: &JobContext,
    ) -> Result<UnitResult, WorkerError> {
        if unit.duration_s() < MIN_UNIT_DURATION_S {
            return Ok(UnitResult::skipped(unit.unit_id, self.id));
        }
        if self.engine.is_none() {
            return Err(WorkerError::Dead);
        }

        let started = Instant::now();
        let wav = TempWav::write(&ctx.units_dir, unit)?;
        let wav_path = wav.path().to_path_buf();
        let mut engine = self.engine.take().ok_or(WorkerError::Dead)?;
        let language = ctx.language.clone();
        let task = ctx.task;
        let prompt = ctx.prompt.clone();

        // The engine call is opaque and blocking; keep it off the
        // runtime's async threads.
        let (engine, outcome) = tokio::task::spawn_blocking(move || {
            let result = engine.transcribe(
                &wav_path,
                language.as_deref(),
                task,
                prompt.as_deref(),
            );
            (engine, result)
        })
        .await
        .map_err(|e| WorkerError::Link(format!("engine task panicked: {}", e)))?;
        self.engine = Some(engine);
        drop(wav);

        let elapsed_s = started.elapsed().as_secs_f64();
        match outcome {
            Ok(segments) => {
                let segments = segments
                    .into_iter()
                    .map(|s| s.rebased(unit.region.start_s))
                    .collect();
                Ok(UnitResult {
                    unit_id: unit.unit_id,
                    status: subtext_common::types::UnitStatus::Ok,
                    segments,
                    error: None,
                    worker_id: self.id,
                    elapsed_s,
                })
            }
            Err(e) if e.is_fatal() => {
                self.engine = None;
                Err(WorkerError::Fatal(e.to_string()))
            }
            Err(e) => Ok(UnitResult::failed(
                unit.unit_id,
                self.id,
                e.to_string(),
                elapsed_s,
            )),
        }
    }
}

impl UnitWorker for InProcessWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn transcribe<'a>(
        &'a mut self,
        unit: &'a WorkUnit,
        ctx: &'a JobContext,
    ) -> BoxFuture<'a, Result<UnitResult, WorkerError>> {
        Box::pin(self.run_unit(unit, ctx))
    }

    fn shutdown(&mut self) -> BoxFuture<'_, ()> {
        self.engine = None;
        Box::pin(async {})
    }
}
