//! Speech segmentation over normalised audio.
//!
//! The detector itself is an external concern hidden behind
//! [`SpeechDetector`]; the default implementation is a frame-energy
//! detector. Detecting zero regions is a valid result and produces an
//! empty subtitle set, not an error.

use tracing::debug;

use subtext_common::types::{SpeechRegion, SAMPLE_RATE};

/// Configuration for speech detection.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Speech probability threshold in [0, 1].
    pub threshold: f32,
    /// Minimum silence required to split regions; shorter silences are
    /// absorbed into the surrounding region. Valid range [10, 2000] ms.
    pub min_silence_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_silence_ms: 100,
        }
    }
}

/// Error type for speech segmentation. Raised only when the detector
/// cannot initialise with the given configuration.
#[derive(Debug)]
pub struct SegmenterError(pub String);

impl std::fmt::Display for SegmenterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Speech detector failed to initialise: {}", self.0)
    }
}

impl std::error::Error for SegmenterError {}

/// Facade over the voice-activity detector.
///
/// Implementations return ordered, pairwise non-overlapping regions
/// covering only speech-active intervals, in seconds.
pub trait SpeechDetector: Send + Sync {
    fn detect(
        &self,
        samples: &[f32],
        config: &SegmenterConfig,
    ) -> Result<Vec<SpeechRegion>, SegmenterError>;
}

/// Frame-energy speech detector.
///
/// Classifies 30 ms frames by RMS level against a threshold-mapped dB
/// floor, absorbs sub-`min_silence` gaps, drops sub-250 ms blips and
/// pads each region by 30 ms so plosive onsets are not clipped.
pub struct EnergyDetector {
    frame_ms: u32,
    /// Minimum speech duration; anything shorter is treated as a transient.
    min_speech_ms: u32,
    /// Padding added around each detected region.
    pad_ms: u32,
}

impl EnergyDetector {
    pub fn new() -> Self {
        Self {
            frame_ms: 30,
            min_speech_ms: 250,
            pad_ms: 30,
        }
    }

    /// Map the [0, 1] threshold onto a dB floor. 0.5 lands on -42 dB,
    /// the level that separates conversational speech from room noise.
    fn threshold_db(threshold: f32) -> f32 {
        -60.0 + threshold * 36.0
    }

    fn frame_rms_db(frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return f32::NEG_INFINITY;
        }
        let sum_squares: f32 = frame.iter().map(|s| s * s).sum();
        let rms = (sum_squares / frame.len() as f32).sqrt();
        if rms <= 0.0 {
            f32::NEG_INFINITY
        } else {
            20.0 * rms.log10()
        }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechDetector for EnergyDetector {
    fn detect(
        &self,
        samples: &[f32],
        config: &SegmenterConfig,
    ) -> Result<Vec<SpeechRegion>, SegmenterError> {
        if !(0.0..=1.0).contains(&config.threshold) {
            return Err(SegmenterError(format!(
                "threshold must be in [0, 1], got {}",
                config.threshold
            )));
        }
        if !(10..=2000).contains(&config.min_silence_ms) {
            return Err(SegmenterError(format!(
                "min_silence_ms must be in [10, 2000], got {}",
                config.min_silence_ms
            )));
        }

        let frame_len = (SAMPLE_RATE * self.frame_ms / 1000) as usize;
        let db_floor = Self::threshold_db(config.threshold);

        // Classify frames and collect raw speech runs in sample indices.
        let mut runs: Vec<(usize, usize)> = Vec::new();
        let mut run_start: Option<usize> = None;
        let mut pos = 0;
        while pos < samples.len() {
            let end = (pos + frame_len).min(samples.len());
            let is_speech = Self::frame_rms_db(&samples[pos..end]) >= db_floor;
            match (is_speech, run_start) {
                (true, None) => run_start = Some(pos),
                (false, Some(start)) => {
                    runs.push((start, pos));
                    run_start = None;
                }
                _ => {}
            }
            pos = end;
        }
        if let Some(start) = run_start {
            runs.push((start, samples.len()));
        }

        // Absorb gaps shorter than min_silence into the surrounding run.
        let min_gap = (SAMPLE_RATE as u64 * config.min_silence_ms as u64 / 1000) as usize;
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(runs.len());
        for (start, end) in runs {
            match merged.last_mut() {
                Some((_, prev_end)) if start.saturating_sub(*prev_end) < min_gap => {
                    *prev_end = end;
                }
                _ => merged.push((start, end)),
            }
        }

        // Drop transients, pad, and re-merge any overlap the padding
        // introduced.
        let min_speech = (SAMPLE_RATE as u64 * self.min_speech_ms as u64 / 1000) as usize;
        let pad = (SAMPLE_RATE as u64 * self.pad_ms as u64 / 1000) as usize;
        let mut regions: Vec<(usize, usize)> = Vec::with_capacity(merged.len());
        for (start, end) in merged {
            if end - start < min_speech {
                continue;
            }
            let start = start.saturating_sub(pad);
            let end = (end + pad).min(samples.len());
            match regions.last_mut() {
                Some((_, prev_end)) if start <= *prev_end => *prev_end = end,
                _ => regions.push((start, end)),
            }
        }

        let result: Vec<SpeechRegion> = regions
            .into_iter()
            .map(|(start, end)| {
                SpeechRegion::new(
                    start as f64 / SAMPLE_RATE as f64,
                    end as f64 / SAMPLE_RATE as f64,
                )
            })
            .collect();

        debug!(
            "Speech detection: {} region(s) over {:.1}s",
            result.len(),
            samples.len() as f64 / SAMPLE_RATE as f64
        );

        Ok(result)
    }
}
