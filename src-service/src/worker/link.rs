//! Parent-side handle to one `subtext-worker` child process.
//!
//! The child gets exactly one device made visible through its
//! environment, loads its model once, and then serves units over a
//! framed-JSON stdio link. Unit audio travels as staged WAV paths
//! inside the session workdir, never through the message itself.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{
    BoxFuture, JobContext, TempWav, UnitWorker, WorkerError, WorkerId, MIN_UNIT_DURATION_S,
};
use crate::partition::WorkUnit;
use subtext_common::ipc::{read_json, write_json, WorkerCommand, WorkerReply};
use subtext_common::types::{ModelKey, UnitResult};

/// Everything needed to spawn one worker process.
#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    /// Path to the `subtext-worker` binary.
    pub worker_bin: PathBuf,
    /// Path to the inference engine binary handed through to the child.
    pub engine_bin: PathBuf,
    pub model_key: ModelKey,
    /// How long a cold model load may take before the spawn counts as
    /// failed.
    pub ready_timeout: Duration,
}

/// A live worker child process.
pub struct ProcessWorker {
    id: WorkerId,
    device: u32,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessWorker {
    /// Spawn the child, restrict it to `device`, and block until its
    /// model is resident (the init barrier contribution of this worker).
    pub async fn spawn(
        config: &WorkerSpawnConfig,
        id: WorkerId,
        device: u32,
    ) -> Result<Self, WorkerError> {
        debug!("Spawning worker {} on device {}", id, device);

        let mut child = Command::new(&config.worker_bin)
            // One device visible: the engine cannot bleed onto siblings.
            .env("CUDA_VISIBLE_DEVICES", device.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::Spawn(format!(
                    "failed to start {}: {}",
                    config.worker_bin.display(),
                    e
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdin unavailable".to_string()))?;
        let mut stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| WorkerError::Spawn("worker stdout unavailable".to_string()))?,
        );

        let init = WorkerCommand::Init {
            worker_id: id,
            device,
            model: config.model_key.model.clone(),
            precision: config.model_key.precision,
            engine_bin: config.engine_bin.display().to_string(),
        };
        write_json(&mut stdin, &init)
            .await
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        let reply = tokio::time::timeout(config.ready_timeout, read_json(&mut stdout))
            .await
            .map_err(|_| {
                WorkerError::Spawn(format!(
                    "worker {} not ready within {:?}",
                    id, config.ready_timeout
                ))
            })?
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        match reply {
            WorkerReply::Ready { worker_id } if worker_id == id => {
                info!("Worker {} ready on device {}", id, device);
                Ok(Self {
                    id,
                    device,
                    child,
                    stdin,
                    stdout,
                })
            }
            WorkerReply::Error { message, .. } => Err(WorkerError::Spawn(message)),
            other => Err(WorkerError::Spawn(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
        }
    }

    #[allow(dead_code)]
    pub fn device(&self) -> u32 {
        self.device
    }

    async fn run_unit(
        &mut self,
        unit: &WorkUnit,
        ctx: &JobContext,
    ) -> Result<UnitResult, WorkerError> {
        if unit.duration_s() < MIN_UNIT_DURATION_S {
            return Ok(UnitResult::skipped(unit.unit_id, self.id));
        }

        let started = Instant::now();
        let wav = TempWav::write(&ctx.units_dir, unit)?;

        let command = WorkerCommand::Transcribe {
            unit_id: unit.unit_id,
            wav_path: wav.path().display().to_string(),
            region_start_s: unit.region.start_s,
            duration_s: unit.duration_s(),
            language: ctx.language.clone(),
            task: ctx.task,
            prompt: ctx.prompt.clone(),
        };
        write_json(&mut self.stdin, &command)
            .await
            .map_err(|e| WorkerError::Link(e.to_string()))?;

        let reply: WorkerReply = read_json(&mut self.stdout)
            .await
            .map_err(|e| WorkerError::Link(e.to_string()))?;
        drop(wav);

        match reply {
            WorkerReply::Unit { result, fatal } => {
                if fatal {
                    let reason = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "device failure".to_string());
                    return Err(WorkerError::Fatal(reason));
                }
                debug!(
                    "Worker {} finished unit {} in {:.1}s",
                    self.id,
                    result.unit_id,
                    started.elapsed().as_secs_f64()
                );
                Ok(result)
            }
            other => Err(WorkerError::Link(format!(
                "unexpected reply to unit {}: {:?}",
                unit.unit_id, other
            ))),
        }
    }

    async fn drain(&mut self) {
        if write_json(&mut self.stdin, &WorkerCommand::Shutdown)
            .await
            .is_ok()
        {
            // Give the child a moment to exit on its own before the
            // kill-on-drop hammer falls.
            match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
                Ok(Ok(status)) => debug!("Worker {} exited: {}", self.id, status),
                Ok(Err(e)) => warn!("Worker {} wait failed: {}", self.id, e),
                Err(_) => warn!("Worker {} did not exit; killing", self.id),
            }
        }
    }
}

impl UnitWorker for ProcessWorker {
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
        Box::pin(self.drain())
    }
}

/// Factory the pool uses to spawn and respawn process workers.
pub struct ProcessWorkerFactory {
    config: WorkerSpawnConfig,
}

impl ProcessWorkerFactory {
    pub fn new(config: WorkerSpawnConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

impl super::pool::WorkerFactory for ProcessWorkerFactory {
    fn spawn(
        &self,
        id: WorkerId,
        device: u32,
    ) -> BoxFuture<'_, Result<Box<dyn UnitWorker>, WorkerError>> {
        Box::pin(async move {
            let worker = ProcessWorker::spawn(&self.config, id, device).await?;
            Ok(Box::new(worker) as Box<dyn UnitWorker>)
        })
    }
}
