//! Audio loading and normalisation.
//!
//! Every input is brought to the one format the rest of the pipeline
//! assumes: mono, 16 kHz, f32 in roughly [-1, 1]. Doing this in a single
//! place keeps sample indices and timestamps consistent downstream; a
//! slice taken at source-rate indices but written as a 16 kHz file would
//! silently shear all subtitle timing.

use std::path::{Path, PathBuf};
use std::process::Command;

use hound::{SampleFormat, WavReader};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{debug, info};

use subtext_common::types::SAMPLE_RATE;

/// Input frames fed to the resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Error type for audio loading.
#[derive(Debug)]
pub enum AudioError {
    /// The container or codec could not be opened/decoded.
    Decode(String),
    /// Decoding succeeded but produced zero samples.
    EmptyAudio,
    /// Resampling to the target rate failed.
    Resample(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::Decode(msg) => write!(f, "Failed to decode audio: {}", msg),
            AudioError::EmptyAudio => write!(f, "Decoded audio is empty"),
            AudioError::Resample(msg) => write!(f, "Resampling failed: {}", msg),
        }
    }
}

impl std::error::Error for AudioError {}

/// Normalised audio: mono, 16 kHz, f32. Immutable after load; work units
/// reference it through `Arc` + sample ranges, so the buffer itself never
/// travels to workers.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Sample range covering `[start_s, end_s)`, clamped to the buffer.
    pub fn sample_range(&self, start_s: f64, end_s: f64) -> std::ops::Range<usize> {
        let start = ((start_s * SAMPLE_RATE as f64).round() as usize).min(self.samples.len());
        let end = ((end_s * SAMPLE_RATE as f64).round() as usize).min(self.samples.len());
        start..end.max(start)
    }
}

/// Load any supported media file as a normalised [`AudioBuffer`].
///
/// WAV containers are decoded directly; everything else goes through an
/// `ffmpeg` decode into `scratch_dir` first.
pub fn load(path: &Path, scratch_dir: &Path) -> Result<AudioBuffer, AudioError> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);

    let buffer = if is_wav {
        load_wav(path)?
    } else {
        let converted = decode_with_ffmpeg(path, scratch_dir)?;
        let result = load_wav(&converted);
        let _ = std::fs::remove_file(&converted);
        result?
    };

    if buffer.is_empty() {
        return Err(AudioError::EmptyAudio);
    }

    info!(
        "Audio loaded: {:.1}s ({} samples @ {}Hz)",
        buffer.duration_s(),
        buffer.len(),
        SAMPLE_RATE
    );

    Ok(buffer)
}

/// Decode a WAV file, downmixing to mono and resampling to 16 kHz as
/// needed.
fn load_wav(path: &Path) -> Result<AudioBuffer, AudioError> {
    let mut reader =
        WavReader::open(path).map_err(|e| AudioError::Decode(format!("{}: {}", path.display(), e)))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Decode(e.to_string()))?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Decode(e.to_string()))?,
        (SampleFormat::Int, bits @ (24 | 32)) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::Decode(e.to_string()))?
        }
        (format, bits) => {
            return Err(AudioError::Decode(format!(
                "unsupported WAV format: {:?} {}-bit",
                format, bits
            )))
        }
    };

    let mono = downmix(&interleaved, spec.channels as usize);
    let samples = if spec.sample_rate == SAMPLE_RATE {
        mono
    } else {
        debug!(
            "Resampling {} Hz -> {} Hz ({} samples)",
            spec.sample_rate,
            SAMPLE_RATE,
            mono.len()
        );
        resample(&mono, spec.sample_rate, SAMPLE_RATE)?
    };

    Ok(AudioBuffer::from_samples(samples))
}

/// Average interleaved channels down to mono.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Polyphase sinc resampling. A no-op is handled by the caller; this is
/// only reached when rates differ.
fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    let mut output = Vec::with_capacity((input.len() as f64 * ratio).ceil() as usize);
    let mut pos = 0;

    while pos + RESAMPLE_CHUNK <= input.len() {
        let frames = resampler
            .process(&[&input[pos..pos + RESAMPLE_CHUNK]], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        output.extend_from_slice(&frames[0]);
        pos += RESAMPLE_CHUNK;
    }

    if pos < input.len() {
        let frames = resampler
            .process_partial(Some(&[&input[pos..]]), None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        output.extend_from_slice(&frames[0]);
    }

    // Drain the filter delay.
    let tail: Option<&[&[f32]]> = None;
    let frames = resampler
        .process_partial(tail, None)
        .map_err(|e| AudioError::Resample(e.to_string()))?;
    output.extend_from_slice(&frames[0]);

    Ok(output)
}

/// Decode an arbitrary container with ffmpeg to a 16 kHz mono WAV inside
/// `scratch_dir`.
fn decode_with_ffmpeg(path: &Path, scratch_dir: &Path) -> Result<PathBuf, AudioError> {
    let out_path = scratch_dir.join("decoded.wav");

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(path)
        .args(["-ar", "16000", "-ac", "1", "-f", "wav", "-y"])
        .arg(&out_path)
        .output()
        .map_err(|e| AudioError::Decode(format!("failed to run ffmpeg: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(AudioError::Decode(format!(
            "ffmpeg could not decode {}: {}",
            path.display(),
            tail
        )));
    }

    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[f32]) {
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn native_rate_mono_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("native.wav");
        let samples: Vec<f32> = (0..16000).map(|i| (i as f32 / 16000.0).sin()).collect();
        write_wav(&path, 16000, 1, &samples);

        let buffer = load(&path, dir.path()).unwrap();
        assert_eq!(buffer.samples(), samples.as_slice());
        assert!((buffer.duration_s() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        // L = 0.5, R = -0.5 on every frame: mono must be 0.
        let interleaved: Vec<f32> = (0..3200).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        write_wav(&path, 16000, 2, &interleaved);

        let buffer = load(&path, dir.path()).unwrap();
        assert_eq!(buffer.len(), 1600);
        assert!(buffer.samples().iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn other_rates_are_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("8k.wav");
        let samples = vec![0.1f32; 8000]; // one second at 8 kHz
        write_wav(&path, 8000, 1, &samples);

        let buffer = load(&path, dir.path()).unwrap();
        // One second of audio, within resampler edge tolerance.
        let expected = SAMPLE_RATE as f64;
        assert!(
            (buffer.len() as f64 - expected).abs() < expected * 0.02,
            "got {} samples",
            buffer.len()
        );
    }

    #[test]
    fn int16_samples_are_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i16.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..1600 {
            writer.write_sample(16384i16).unwrap();
        }
        writer.finalize().unwrap();

        let buffer = load(&path, dir.path()).unwrap();
        assert!(buffer.samples().iter().all(|s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn empty_wav_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        write_wav(&path, 16000, 1, &[]);

        match load(&path, dir.path()) {
            Err(AudioError::EmptyAudio) => {}
            other => panic!("expected EmptyAudio, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn unreadable_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-audio.wav");
        std::fs::write(&path, b"definitely not a wav").unwrap();

        assert!(matches!(load(&path, dir.path()), Err(AudioError::Decode(_))));
    }

    #[test]
    fn sample_range_clamps_to_buffer() {
        let buffer = AudioBuffer::from_samples(vec![0.0; 16000]);
        assert_eq!(buffer.sample_range(0.0, 0.5), 0..8000);
        assert_eq!(buffer.sample_range(0.5, 2.0), 8000..16000);
        assert_eq!(buffer.sample_range(3.0, 4.0), 16000..16000);
    }
}
