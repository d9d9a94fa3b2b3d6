//! Subtext Inference Worker
//!
//! One worker process per device: the supervisor spawns this binary
//! with `CUDA_VISIBLE_DEVICES` restricted to a single ordinal, so the
//! engine (and anything it spawns) can only ever see its own device.
//! The model is loaded once, on the `init` handshake, and stays
//! resident for the lifetime of the process.
//!
//! Protocol: framed JSON over stdin/stdout (see `subtext_common::ipc`);
//! logs go to stderr, which the supervisor passes through.

use std::path::Path;
use std::time::Instant;

use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use subtext_common::ipc::{read_json, write_json, IpcError, WorkerCommand, WorkerReply};
use subtext_common::types::{ModelKey, Task, UnitResult, UnitStatus};
use subtext_service::engine::{CommandEngine, InferenceEngine};
use subtext_service::worker::MIN_UNIT_DURATION_S;

fn main() {
    // stdout is the protocol channel; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let exit_code = runtime.block_on(run());
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();

    // The handshake is always first: it tells us who we are and which
    // model to make resident.
    let init: WorkerCommand = match read_json(&mut input).await {
        Ok(command) => command,
        Err(e) => {
            error!("Failed to read init command: {}", e);
            return 1;
        }
    };
    let (worker_id, device, model, precision, engine_bin) = match init {
        WorkerCommand::Init {
            worker_id,
            device,
            model,
            precision,
            engine_bin,
        } => (worker_id, device, model, precision, engine_bin),
        other => {
            error!("Expected init, got {:?}", other);
            return 1;
        }
    };

    info!(
        "Worker {} starting on device {} (model {} @ {})",
        worker_id, device, model, precision
    );

    let mut engine = CommandEngine::new(engine_bin, ModelKey::new(model, precision));
    if let Err(e) = engine.load() {
        error!("Model load failed: {}", e);
        let reply = WorkerReply::Error {
            message: e.to_string(),
            fatal: e.is_fatal(),
        };
        let _ = write_json(&mut output, &reply).await;
        return 1;
    }

    info!("Worker {} ready", worker_id);
    if let Err(e) = write_json(&mut output, &WorkerReply::Ready { worker_id }).await {
        error!("Failed to report ready: {}", e);
        return 1;
    }

    // Serve units one at a time until told to stop or the supervisor
    // goes away.
    loop {
        let command: WorkerCommand = match read_json(&mut input).await {
            Ok(command) => command,
            Err(IpcError::ConnectionClosed) => {
                info!("Supervisor closed the link; exiting");
                break;
            }
            Err(e) => {
                error!("Failed to read command: {}", e);
                return 1;
            }
        };

        match command {
            WorkerCommand::Transcribe {
                unit_id,
                wav_path,
                region_start_s,
                duration_s,
                language,
                task,
                prompt,
            } => {
                let (result, fatal) = run_unit(
                    &mut engine,
                    worker_id,
                    unit_id,
                    &wav_path,
                    region_start_s,
                    duration_s,
                    language.as_deref(),
                    task,
                    prompt.as_deref(),
                );
                if let Err(e) = write_json(&mut output, &WorkerReply::Unit { result, fatal }).await
                {
                    error!("Failed to report unit {}: {}", unit_id, e);
                    return 1;
                }
            }
            WorkerCommand::Shutdown => {
                info!("Worker {} draining", worker_id);
                break;
            }
            WorkerCommand::Init { .. } => {
                warn!("Ignoring duplicate init");
            }
        }
    }

    0
}

/// Transcribe one staged unit: skip sub-threshold units, rebase segment
/// times to the global timeline, and remove the staged file on every
/// path.
#[allow(clippy::too_many_arguments)]
fn run_unit(
    engine: &mut dyn InferenceEngine,
    worker_id: usize,
    unit_id: u64,
    wav_path: &str,
    region_start_s: f64,
    duration_s: f64,
    language: Option<&str>,
    task: Task,
    prompt: Option<&str>,
) -> (UnitResult, bool) {
    if duration_s < MIN_UNIT_DURATION_S {
        remove_staged(wav_path);
        return (UnitResult::skipped(unit_id, worker_id), false);
    }

    let started = Instant::now();
    let outcome = engine.transcribe(Path::new(wav_path), language, task, prompt);
    remove_staged(wav_path);
    let elapsed_s = started.elapsed().as_secs_f64();

    match outcome {
        Ok(segments) => {
            let segments = segments
                .into_iter()
                .map(|s| s.rebased(region_start_s))
                .collect();
            (
                UnitResult {
                    unit_id,
                    status: UnitStatus::Ok,
                    segments,
                    error: None,
                    worker_id,
                    elapsed_s,
                },
                false,
            )
        }
        Err(e) => {
            let fatal = e.is_fatal();
            if fatal {
                error!("Unit {} poisoned the worker: {}", unit_id, e);
            } else {
                warn!("Unit {} failed: {}", unit_id, e);
            }
            (
                UnitResult::failed(unit_id, worker_id, e.to_string(), elapsed_s),
                fatal,
            )
        }
    }
}

fn remove_staged(wav_path: &str) {
    if let Err(e) = std::fs::remove_file(wav_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staged unit {}: {}", wav_path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subtext_common::types::TextSegment;
    use subtext_service::engine::{EngineError, EngineErrorKind};

    struct CannedEngine {
        segments: Vec<TextSegment>,
        error: Option<EngineErrorKind>,
        calls: usize,
    }

    impl InferenceEngine for CannedEngine {
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
            self.calls += 1;
            match self.error {
                Some(kind) => Err(EngineError::new(kind, "injected")),
                None => Ok(self.segments.clone()),
            }
        }
    }

    fn staged_file() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit-0.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        (dir, path.display().to_string())
    }

    #[test]
    fn segments_are_rebased_and_file_removed() {
        let (dir, path) = staged_file();
        let mut engine = CannedEngine {
            segments: vec![TextSegment::new(0.5, 2.0, "hi")],
            error: None,
            calls: 0,
        };

        let (result, fatal) =
            run_unit(&mut engine, 1, 0, &path, 30.0, 10.0, None, Task::Transcribe, None);

        assert!(!fatal);
        assert_eq!(result.status, UnitStatus::Ok);
        assert_eq!(result.segments[0].start_s, 30.5);
        assert_eq!(result.segments[0].end_s, 32.0);
        assert_eq!(result.worker_id, 1);
        assert!(!std::path::Path::new(&path).exists());
        drop(dir);
    }

    #[test]
    fn short_units_are_skipped_without_an_engine_call() {
        let (dir, path) = staged_file();
        let mut engine = CannedEngine {
            segments: vec![],
            error: None,
            calls: 0,
        };

        let (result, fatal) =
            run_unit(&mut engine, 0, 3, &path, 0.0, 0.05, None, Task::Transcribe, None);

        assert!(!fatal);
        assert_eq!(result.status, UnitStatus::Skipped);
        assert!(result.segments.is_empty());
        assert_eq!(engine.calls, 0);
        assert!(!std::path::Path::new(&path).exists());
        drop(dir);
    }

    #[test]
    fn inference_error_is_nonfatal_failure() {
        let (dir, path) = staged_file();
        let mut engine = CannedEngine {
            segments: vec![],
            error: Some(EngineErrorKind::Inference),
            calls: 0,
        };

        let (result, fatal) =
            run_unit(&mut engine, 0, 5, &path, 0.0, 10.0, None, Task::Transcribe, None);

        assert!(!fatal);
        assert_eq!(result.status, UnitStatus::Failed);
        assert!(result.error.is_some());
        assert!(!std::path::Path::new(&path).exists());
        drop(dir);
    }

    #[test]
    fn oom_is_fatal() {
        let (dir, path) = staged_file();
        let mut engine = CannedEngine {
            segments: vec![],
            error: Some(EngineErrorKind::OutOfMemory),
            calls: 0,
        };

        let (result, fatal) =
            run_unit(&mut engine, 0, 7, &path, 0.0, 10.0, None, Task::Transcribe, None);

        assert!(fatal);
        assert_eq!(result.status, UnitStatus::Failed);
        drop(dir);
    }
}
