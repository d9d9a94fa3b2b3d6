//! Audio normalisation and speech detection.

pub mod loader;
pub mod segmenter;

pub use loader::{load, AudioBuffer, AudioError};
pub use segmenter::{EnergyDetector, SegmenterConfig, SegmenterError, SpeechDetector};
