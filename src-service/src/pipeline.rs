//! The transcription pipeline: one request end to end.
//!
//! Control flow per request: session workspace -> admission -> source
//! resolution -> audio normalisation -> speech detection ->
//! partitioning -> scheduling across workers -> merge/convert -> SRT
//! artefact. The
//! session workdir is removed on every exit path; the admission slot is
//! released by the handle's drop guard on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::admission::{AdmissionError, CachedEngine, TranscriberPool};
use crate::audio::{self, AudioError, SegmenterConfig, SpeechDetector};
use crate::config::ServiceConfig;
use crate::engine::InferenceEngine;
use crate::fetch::{self, MediaFetcher};
use crate::partition::partition;
use crate::postprocess::{self, ScriptConverter};
use crate::scheduler::{self, CancelFlag, ScheduleConfig, ScheduleError};
use crate::session::{Session, SessionManager};
use crate::worker::link::ProcessWorkerFactory;
use crate::worker::pool::{Lease, WorkerFactory, WorkerPool};
use crate::worker::{InProcessWorker, JobContext};
use subtext_common::srt;
use subtext_common::types::{
    EngineMode, ModelKey, SpeechRegion, TranscribeOutcome, TranscribeRequest,
};

/// Session-aborting errors, the user-visible taxonomy. Per-unit
/// failures never appear here; they ride along as warnings in the
/// outcome.
#[derive(Debug)]
pub enum RequestError {
    /// Unreadable or invalid input; the session is aborted and the
    /// admission slot released.
    Input(String),
    /// No admission slot within the deadline; the caller may retry.
    AdmissionTimeout(String),
    /// A worker could not initialise its device or model, twice.
    WorkerSpawn(String),
    /// Device memory exhausted repeatedly.
    DeviceExhaustion(String),
    /// The request was cancelled.
    Cancelled,
    /// Anything else that aborts the session.
    Internal(String),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Input(msg) => write!(f, "Invalid input: {}", msg),
            RequestError::AdmissionTimeout(msg) => write!(f, "Admission timed out: {}", msg),
            RequestError::WorkerSpawn(msg) => write!(f, "Worker startup failed: {}", msg),
            RequestError::DeviceExhaustion(msg) => write!(f, "{}", msg),
            RequestError::Cancelled => write!(f, "Request cancelled"),
            RequestError::Internal(msg) => write!(f, "Transcription failed: {}", msg),
        }
    }
}

impl std::error::Error for RequestError {}

/// Builds the single-mode engine for a model key.
pub type EngineBuilder = Box<dyn Fn(ModelKey) -> Box<dyn InferenceEngine> + Send + Sync>;

/// Builds the worker factory for a model key (parallel mode).
pub type FactoryBuilder = Box<dyn Fn(ModelKey) -> Arc<dyn WorkerFactory> + Send + Sync>;

/// Everything a request handler needs, passed explicitly rather than
/// through ambient globals.
pub struct ServiceState {
    pub config: ServiceConfig,
    pub sessions: SessionManager,
    pub admission: TranscriberPool,
    pub detector: Box<dyn SpeechDetector>,
    pub converter: Box<dyn ScriptConverter>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub engine_builder: EngineBuilder,
    pub factory_builder: FactoryBuilder,
}

impl ServiceState {
    /// Production wiring.
    pub fn new(config: ServiceConfig) -> std::io::Result<Self> {
        let layout = config.storage_layout();
        layout.ensure()?;
        let sessions = SessionManager::new(layout, config.max_artifact_age());
        let admission = TranscriberPool::new(config.scheduling.max_sessions);

        let engine_config = config.clone();
        let engine_builder: EngineBuilder = Box::new(move |key| {
            Box::new(crate::engine::CommandEngine::new(
                &engine_config.engine.engine_bin,
                key,
            ))
        });

        let factory_config = config.clone();
        let factory_builder: FactoryBuilder = Box::new(move |key| {
            let factory: Arc<dyn WorkerFactory> =
                ProcessWorkerFactory::new(factory_config.spawn_config(key));
            factory
        });

        Ok(Self {
            config,
            sessions,
            admission,
            detector: Box::new(audio::EnergyDetector::new()),
            converter: Box::new(postprocess::OpenCcConverter::new()),
            fetcher: Arc::new(fetch::YtDlpFetcher),
            engine_builder,
            factory_builder,
        })
    }

    /// Warm the default single-mode engine so the first request does
    /// not pay the cold load. Failures are logged, never fatal.
    pub async fn preload(&self) {
        let key = self.config.default_model_key();
        info!("Preloading engine {}", key);
        let handle = self
            .admission
            .acquire(std::time::Duration::from_secs(5))
            .await;
        let Ok(mut handle) = handle else {
            warn!("Preload skipped: no admission slot");
            return;
        };
        let result = handle
            .engine_for((EngineMode::Single, key.clone()), || async move {
                build_single_engine(self, key).await
            })
            .await;
        if let Err(e) = result {
            warn!("Preload failed: {}", e);
        }
    }
}

/// Run one transcription request to completion.
pub async fn transcribe(
    state: &ServiceState,
    request: TranscribeRequest,
    cancel: &CancelFlag,
) -> Result<TranscribeOutcome, RequestError> {
    let started = Instant::now();
    request.validate().map_err(RequestError::Input)?;

    // Bounded-frequency housekeeping: one sweep per session start.
    state.sessions.sweep_stale();

    let session = state
        .sessions
        .create_session()
        .map_err(|e| RequestError::Internal(e.to_string()))?;

    // The session value owns the workdir; run the request and close it
    // on the way out. Early returns and panics both land in the drop
    // guard.
    let result = run_session(state, &session, &request, cancel, started).await;
    session.close();
    result
}

async fn run_session(
    state: &ServiceState,
    session: &Session,
    request: &TranscribeRequest,
    cancel: &CancelFlag,
    started: Instant,
) -> Result<TranscribeOutcome, RequestError> {
    let mut handle = state
        .admission
        .acquire(state.config.admission_deadline())
        .await
        .map_err(|e| match e {
            AdmissionError::Timeout { .. } => RequestError::AdmissionTimeout(e.to_string()),
            AdmissionError::Closed => RequestError::Internal(e.to_string()),
        })?;

    let mut warnings: Vec<String> = Vec::new();

    // Resolve the source. Remote media lands in the shared download
    // cache; local files are copied into the session workdir under a
    // collision-proof name.
    let (audio_path, title) = if fetch::is_media_url(&request.source) {
        let fetcher = Arc::clone(&state.fetcher);
        let url = request.source.clone();
        let dest = state.sessions.layout().downloads_dir.clone();
        let (path, title) = tokio::task::spawn_blocking(move || fetcher.fetch(&url, &dest))
            .await
            .map_err(|e| RequestError::Internal(e.to_string()))?
            .map_err(|e| RequestError::Input(e.to_string()))?;
        (path, title)
    } else {
        let source = Path::new(&request.source);
        let title = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
            .to_string();
        let imported = session
            .import_input(source)
            .map_err(|e| RequestError::Input(e.to_string()))?;
        (imported, title)
    };

    // Normalise to mono 16 kHz.
    let workdir = session.workdir().to_path_buf();
    let audio_buffer = tokio::task::spawn_blocking(move || audio::load(&audio_path, &workdir))
        .await
        .map_err(|e| RequestError::Internal(e.to_string()))?
        .map_err(|e| match e {
            AudioError::Resample(msg) => RequestError::Internal(msg),
            other => RequestError::Input(other.to_string()),
        })?;
    let audio_buffer = Arc::new(audio_buffer);
    let duration_s = audio_buffer.duration_s();

    // Detect speech.
    let regions = if request.use_vad {
        let segmenter_config = SegmenterConfig {
            threshold: 0.5,
            min_silence_ms: (request.min_silence_s * 1000.0).round() as u32,
        };
        state
            .detector
            .detect(audio_buffer.samples(), &segmenter_config)
            .map_err(|e| RequestError::Internal(e.to_string()))?
    } else {
        // No detector: the whole file is one region and the
        // partitioner's oversize tolerance carries it.
        vec![SpeechRegion::new(0.0, duration_s)]
    };

    if regions.is_empty() {
        info!("Session {}: no speech detected", session.id());
        return Ok(TranscribeOutcome {
            subtitles: String::new(),
            subtitles_path: None,
            segment_count: 0,
            failed_units: 0,
            skipped_units: 0,
            warnings,
            audio_duration_s: duration_s,
            elapsed_s: started.elapsed().as_secs_f64(),
        });
    }

    // Partition into units; from here on only slice views travel.
    let worker_count = if request.parallel {
        state.config.scheduling.devices.len()
    } else {
        1
    };
    let units = partition(
        &audio_buffer,
        &regions,
        &state.config.partition_config(),
        worker_count,
    );
    drop(audio_buffer);
    info!(
        "Session {}: {} region(s) -> {} unit(s)",
        session.id(),
        regions.len(),
        units.len()
    );

    // Engine acquisition (cached per admission slot) and scheduling.
    let key = request.model_key();
    let mode = if request.parallel {
        EngineMode::Parallel
    } else {
        EngineMode::Single
    };
    let engine = handle
        .engine_for((mode, key.clone()), || async move {
            match mode {
                EngineMode::Single => build_single_engine(state, key).await,
                EngineMode::Parallel => {
                    let factory = (state.factory_builder)(key);
                    let pool =
                        WorkerPool::start(factory, state.config.scheduling.devices.clone())
                            .await
                            .map_err(|e| RequestError::WorkerSpawn(e.to_string()))?;
                    Ok(CachedEngine::Parallel {
                        pool: Arc::new(pool),
                    })
                }
            }
        })
        .await?;

    let ctx = JobContext {
        units_dir: session.units_dir(),
        language: normalize_language(request.language.as_deref()),
        task: request.task,
        prompt: None,
    };
    let schedule_config = ScheduleConfig::default();

    let mut engine_died = false;
    let schedule_result = match engine {
        CachedEngine::Single { worker } => {
            let leased = worker
                .take()
                .ok_or_else(|| RequestError::Internal("engine already in use".to_string()))?;
            let (mut leases, result) = scheduler::run(
                vec![Lease::detached(leased)],
                units,
                ctx,
                &schedule_config,
                cancel,
            )
            .await;
            if let Some(lease) = leases.pop() {
                *worker = lease.into_worker();
            }
            engine_died = worker.is_none();
            result
        }
        CachedEngine::Parallel { pool } => {
            let leases = pool
                .lease_all()
                .await
                .map_err(|e| RequestError::WorkerSpawn(e.to_string()))?;
            let (leases, result) = scheduler::run(leases, units, ctx, &schedule_config, cancel).await;
            pool.restore(leases);
            result
        }
    };
    if engine_died {
        // The resident engine is gone; make the next session rebuild
        // instead of tripping over an empty slot.
        handle.clear_engine();
    }

    let schedule = schedule_result.map_err(|e| match e {
        ScheduleError::DeviceExhaustion => RequestError::DeviceExhaustion(e.to_string()),
        ScheduleError::Cancelled => RequestError::Cancelled,
        ScheduleError::WorkersExhausted { .. } => RequestError::Internal(e.to_string()),
    })?;
    warnings.extend(schedule.warnings);

    // Post-processing.
    let mut segments = schedule.segments;
    if request.merge {
        segments = postprocess::merge_segments(segments, request.max_chars);
    }
    if request.convert_script && postprocess::is_chinese(request.language.as_deref()) {
        if let Err(e) = postprocess::convert_segments(&mut segments, state.converter.as_ref()) {
            warn!("Session {}: {}", session.id(), e);
            warnings.push(format!("script conversion skipped: {}", e));
        }
    }

    // Render and persist the artefact.
    let subtitles = srt::render(&segments);
    let subtitles_path = if segments.is_empty() {
        None
    } else {
        let filename = format!(
            "{}_{}.srt",
            sanitize_title(&title),
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = state.sessions.layout().outputs_dir.join(filename);
        match std::fs::write(&path, &subtitles) {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                warn!("Failed to persist subtitles: {}", e);
                warnings.push(format!("could not persist subtitle file: {}", e));
                None
            }
        }
    };

    let elapsed_s = started.elapsed().as_secs_f64();
    info!(
        "Session {}: {} subtitle(s) in {:.1}s ({:.1}x realtime)",
        session.id(),
        segments.len(),
        elapsed_s,
        if elapsed_s > 0.0 { duration_s / elapsed_s } else { 0.0 }
    );

    Ok(TranscribeOutcome {
        subtitles,
        subtitles_path,
        segment_count: segments.len(),
        failed_units: schedule.failed_units,
        skipped_units: schedule.skipped_units,
        warnings,
        audio_duration_s: duration_s,
        elapsed_s,
    })
}

/// Build and warm the single-mode engine, retrying the load once.
async fn build_single_engine(
    state: &ServiceState,
    key: ModelKey,
) -> Result<CachedEngine, RequestError> {
    for attempt in 0..2 {
        let engine = (state.engine_builder)(key.clone());
        let started = tokio::task::spawn_blocking(move || InProcessWorker::start(0, engine))
            .await
            .map_err(|e| RequestError::Internal(e.to_string()))?;
        match started {
            Ok(worker) => {
                return Ok(CachedEngine::Single {
                    worker: Some(Box::new(worker)),
                })
            }
            Err(e) if attempt == 0 => {
                warn!("Engine load failed ({}); retrying once", e);
            }
            Err(e) => return Err(RequestError::WorkerSpawn(e.to_string())),
        }
    }
    unreachable!("load loop returns on success or second failure")
}

/// `auto` and empty mean auto-detect.
fn normalize_language(language: Option<&str>) -> Option<String> {
    match language {
        None => None,
        Some(l) if l.is_empty() || l.eq_ignore_ascii_case("auto") => None,
        Some(l) => Some(l.to_string()),
    }
}

/// Keep alphanumerics, spaces, dashes and underscores; cap the length.
fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let trimmed = cleaned.trim();
    let capped: String = trimmed.chars().take(50).collect();
    if capped.is_empty() {
        "output".to_string()
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::EnergyDetector;
    use crate::engine::testing::FakeEngine;
    use crate::postprocess::ConvertError;
    use crate::session::StorageLayout;
    use crate::worker::pool::testing::FakeFactory;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use subtext_common::types::TextSegment;

    /// Converter that swaps one simplified glyph for its traditional
    /// form, so conversions are observable.
    struct GlyphConverter;

    impl ScriptConverter for GlyphConverter {
        fn convert(&self, text: &str) -> Result<String, ConvertError> {
            Ok(text.replace('简', "簡"))
        }
    }

    struct BrokenConverter;

    impl ScriptConverter for BrokenConverter {
        fn convert(&self, _text: &str) -> Result<String, ConvertError> {
            Err(ConvertError::Failed("dictionaries missing".to_string()))
        }
    }

    struct StubFetcher;

    impl MediaFetcher for StubFetcher {
        fn fetch(
            &self,
            _url: &str,
            dest_dir: &Path,
        ) -> Result<(PathBuf, String), crate::fetch::FetchError> {
            std::fs::create_dir_all(dest_dir).unwrap();
            let path = dest_dir.join("vid00000001.wav");
            write_tone_wav(&path, 3.0, &[(0.5, 2.5)]);
            Ok((path, "Remote Talk".to_string()))
        }
    }

    /// Write a 16 kHz mono WAV with tone bursts over the given spans.
    fn write_tone_wav(path: &Path, duration_s: f64, bursts: &[(f64, f64)]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let total = (duration_s * 16000.0) as usize;
        let mut samples = vec![0.0f32; total];
        for &(start, end) in bursts {
            let range = (start * 16000.0) as usize..((end * 16000.0) as usize).min(total);
            for (i, sample) in samples[range].iter_mut().enumerate() {
                *sample = 0.5 * (i as f32 * 0.3).sin();
            }
        }
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    struct TestHarness {
        state: ServiceState,
        root: tempfile::TempDir,
        engine_builds: Arc<AtomicUsize>,
        engine_loads: Arc<AtomicUsize>,
        factory: Arc<FakeFactory>,
    }

    impl TestHarness {
        fn new(max_sessions: usize, devices: Vec<u32>) -> Self {
            Self::with_converter(max_sessions, devices, Box::new(GlyphConverter))
        }

        fn with_converter(
            max_sessions: usize,
            devices: Vec<u32>,
            converter: Box<dyn ScriptConverter>,
        ) -> Self {
            let root = tempfile::tempdir().unwrap();

            let mut config = ServiceConfig::default();
            config.storage.data_dir = Some(root.path().display().to_string());
            config.scheduling.max_sessions = max_sessions;
            config.scheduling.devices = devices;
            config.scheduling.admission_deadline_s = 5;

            let layout = StorageLayout::under(root.path());
            layout.ensure().unwrap();
            let sessions = SessionManager::new(layout, Duration::from_secs(24 * 3600));
            let admission = TranscriberPool::new(config.scheduling.max_sessions);

            let engine_builds = Arc::new(AtomicUsize::new(0));
            let engine_loads = Arc::new(AtomicUsize::new(0));
            let segments = vec![TextSegment::new(0.2, 1.4, "hello world")];
            let builds = Arc::clone(&engine_builds);
            let loads = Arc::clone(&engine_loads);
            let engine_builder: EngineBuilder = Box::new(move |_key| {
                builds.fetch_add(1, Ordering::SeqCst);
                let engine = FakeEngine::new(segments.clone());
                // Track loads across every engine this builder makes.
                let engine = FakeEngine {
                    loads: Arc::clone(&loads),
                    ..engine
                };
                Box::new(engine)
            });

            let factory = FakeFactory::new(vec![]);
            let factory_for_builder = Arc::clone(&factory);
            let factory_builder: FactoryBuilder = Box::new(move |_key| {
                let factory: Arc<dyn WorkerFactory> = Arc::clone(&factory_for_builder) as Arc<dyn WorkerFactory>;
                factory
            });

            let state = ServiceState {
                config,
                sessions,
                admission,
                detector: Box::new(EnergyDetector::new()),
                converter,
                fetcher: Arc::new(StubFetcher),
                engine_builder,
                factory_builder,
            };

            Self {
                state,
                root,
                engine_builds,
                engine_loads,
                factory,
            }
        }

        fn input_wav(&self, name: &str, duration_s: f64, bursts: &[(f64, f64)]) -> String {
            let path = self.root.path().join(name);
            write_tone_wav(&path, duration_s, bursts);
            path.display().to_string()
        }

        fn sessions_root(&self) -> PathBuf {
            self.root.path().join("sessions")
        }

        async fn run(&self, request: TranscribeRequest) -> Result<TranscribeOutcome, RequestError> {
            transcribe(&self.state, request, &CancelFlag::new()).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silence_yields_empty_srt_and_clean_sessions_root() {
        let harness = TestHarness::new(2, vec![0]);
        let source = harness.input_wav("silence.wav", 2.0, &[]);

        let mut request = TranscribeRequest::new(source);
        request.min_silence_s = 0.1;
        let outcome = harness.run(request).await.unwrap();

        assert_eq!(outcome.subtitles, "");
        assert_eq!(outcome.segment_count, 0);
        assert!(outcome.subtitles_path.is_none());
        assert!((outcome.audio_duration_s - 2.0).abs() < 0.01);

        // No session residue.
        let leftovers: Vec<_> = std::fs::read_dir(harness.sessions_root())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_sentence_single_worker() {
        let harness = TestHarness::new(2, vec![0]);
        let source = harness.input_wav("sentence.wav", 3.0, &[(0.5, 2.5)]);

        let outcome = harness.run(TranscribeRequest::new(source)).await.unwrap();

        assert_eq!(outcome.segment_count, 1);
        assert!(outcome.subtitles.contains("hello world"));
        assert!(outcome.subtitles.ends_with('\n'));
        assert!(outcome.subtitles_path.is_some());
        assert_eq!(outcome.failed_units, 0);
        assert_eq!(harness.engine_loads.load(Ordering::SeqCst), 1);

        // Engine spoke unit-local time; output must be absolute: the
        // burst starts around 0.5s, so the segment cannot start at 0.2s.
        let parsed = srt::parse(&outcome.subtitles);
        assert!(parsed[0].start_s > 0.4, "start {}", parsed[0].start_s);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_is_reused_across_sessions_with_same_key() {
        let harness = TestHarness::new(2, vec![0]);
        let source = harness.input_wav("reuse.wav", 3.0, &[(0.5, 2.5)]);

        for _ in 0..3 {
            harness
                .run(TranscribeRequest::new(source.clone()))
                .await
                .unwrap();
        }

        // One build, one load; two cache reuses.
        assert_eq!(harness.engine_builds.load(Ordering::SeqCst), 1);
        assert_eq!(harness.engine_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_mode_drives_the_worker_pool() {
        let harness = TestHarness::new(2, vec![0, 1, 2, 3]);
        // Four 30s bursts, 2s apart: any two would exceed the 45s unit
        // bound, so each becomes its own unit.
        let bursts: Vec<(f64, f64)> = (0..4)
            .map(|i| (i as f64 * 32.0 + 1.0, i as f64 * 32.0 + 31.0))
            .collect();
        let source = harness.input_wav("long.wav", 130.0, &bursts);

        let mut request = TranscribeRequest::new(source.clone());
        request.parallel = true;
        request.merge = false;
        let outcome = harness.run(request).await.unwrap();

        assert_eq!(outcome.segment_count, 4);
        // Fake workers emit "u<id>"; order must be by unit id.
        let parsed = srt::parse(&outcome.subtitles);
        let texts: Vec<&str> = parsed.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["u0", "u1", "u2", "u3"]);
        for pair in parsed.windows(2) {
            assert!(pair[0].start_s <= pair[1].start_s);
        }

        // Pool spawned one worker per device, once.
        assert_eq!(harness.factory.spawn_count.load(Ordering::SeqCst), 4);

        // Second parallel session reuses the pool: no new spawns.
        let mut request = TranscribeRequest::new(source);
        request.parallel = true;
        harness.run(request).await.unwrap();
        assert_eq!(harness.factory.spawn_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_source_goes_through_the_fetcher() {
        let harness = TestHarness::new(2, vec![0]);

        let outcome = harness
            .run(TranscribeRequest::new("https://media.example/v/abc123"))
            .await
            .unwrap();

        assert_eq!(outcome.segment_count, 1);
        let path = outcome.subtitles_path.unwrap();
        assert!(path.contains("Remote Talk"), "artefact named {}", path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_input_is_an_input_error_and_cleans_up() {
        let harness = TestHarness::new(2, vec![0]);

        let result = harness
            .run(TranscribeRequest::new("/nonexistent/talk.wav"))
            .await;
        assert!(matches!(result, Err(RequestError::Input(_))));

        let leftovers: Vec<_> = std::fs::read_dir(harness.sessions_root())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        // The admission slot came back.
        assert_eq!(harness.state.admission.active_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chinese_output_is_script_converted() {
        let mut harness = TestHarness::new(2, vec![0]);
        let source = harness.input_wav("zh.wav", 3.0, &[(0.5, 2.5)]);

        // The fake engine says simplified text; conversion must flip it.
        harness.state.engine_builder = Box::new(move |_key| {
            Box::new(FakeEngine::new(vec![TextSegment::new(0.2, 1.4, "简体字")]))
        });

        let mut request = TranscribeRequest::new(source);
        request.language = Some("zh".to_string());
        request.convert_script = true;
        let outcome = harness.run(request).await.unwrap();

        assert!(outcome.subtitles.contains("簡体字"));
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broken_converter_preserves_text_and_warns() {
        let mut harness =
            TestHarness::with_converter(2, vec![0], Box::new(BrokenConverter));
        let source = harness.input_wav("zh2.wav", 3.0, &[(0.5, 2.5)]);
        harness.state.engine_builder =
            Box::new(move |_key| Box::new(FakeEngine::new(vec![TextSegment::new(0.2, 1.4, "简体字")])));

        let mut request = TranscribeRequest::new(source);
        request.language = Some("zh".to_string());
        request.convert_script = true;
        let outcome = harness.run(request).await.unwrap();

        assert!(outcome.subtitles.contains("简体字"));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("script conversion"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admission_saturation_blocks_the_extra_session() {
        let harness = TestHarness::new(1, vec![0]);
        let source = harness.input_wav("queue.wav", 3.0, &[(0.5, 2.5)]);

        // Hold the only slot: a second caller times out.
        let held = harness
            .state
            .admission
            .acquire(Duration::from_millis(100))
            .await
            .unwrap();
        let blocked = harness
            .state
            .admission
            .acquire(Duration::from_millis(50))
            .await;
        assert!(blocked.is_err());

        // After release the same request sails through.
        drop(held);
        let outcome = harness.run(TranscribeRequest::new(source)).await.unwrap();
        assert_eq!(outcome.segment_count, 1);
    }

    #[test]
    fn title_sanitisation() {
        assert_eq!(sanitize_title("My Talk: Part 1/2"), "My Talk Part 12");
        assert_eq!(sanitize_title("///"), "output");
        assert_eq!(sanitize_title(""), "output");
        let long = "x".repeat(80);
        assert_eq!(sanitize_title(&long).chars().count(), 50);
    }

    #[test]
    fn language_normalisation() {
        assert_eq!(normalize_language(Some("auto")), None);
        assert_eq!(normalize_language(Some("")), None);
        assert_eq!(normalize_language(None), None);
        assert_eq!(normalize_language(Some("zh")), Some("zh".to_string()));
    }
}
