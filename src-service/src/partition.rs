//! Work partitioning: rebalancing speech regions into dispatchable
//! units.
//!
//! Units that are too small amortise worker dispatch poorly; units that
//! are too large starve parallelism through tail latency on one worker.
//! The partitioner walks the detected regions in order and concatenates
//! neighbours until a unit would exceed the upper bound.

use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::audio::AudioBuffer;
use subtext_common::types::SpeechRegion;

/// Bounds for unit sizing.
#[derive(Debug, Clone, Copy)]
pub struct PartitionConfig {
    /// Target lower bound on unit duration.
    pub min_unit_s: f64,
    /// Upper bound on unit duration; exceeded only by a single region
    /// that cannot be split without cutting into speech.
    pub max_unit_s: f64,
    /// Regions shorter than this are dropped before partitioning: too
    /// brief to yield useful text, and dispatch overhead would swamp
    /// the work.
    pub min_region_s: f64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            min_unit_s: 15.0,
            max_unit_s: 45.0,
            min_region_s: 0.5,
        }
    }
}

/// One dispatchable interval of audio: the bounding span of one or more
/// consecutive speech regions, plus a view into the shared buffer.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Rank in input order: dense, 0-based.
    pub unit_id: u64,
    /// Bounding span `[start_s, end_s)` of the member regions.
    pub region: SpeechRegion,
    audio: Arc<AudioBuffer>,
    range: Range<usize>,
}

impl WorkUnit {
    /// Build a unit covering `region` within the shared buffer.
    pub fn new(unit_id: u64, region: SpeechRegion, audio: Arc<AudioBuffer>) -> Self {
        Self {
            unit_id,
            range: audio.sample_range(region.start_s, region.end_s),
            region,
            audio,
        }
    }

    /// Zero-copy view of this unit's samples.
    pub fn samples(&self) -> &[f32] {
        &self.audio.samples()[self.range.clone()]
    }

    pub fn duration_s(&self) -> f64 {
        self.region.duration_s()
    }
}

/// Partition speech regions into work units.
///
/// Invariants on the output: unit ids are dense `[0, M)`; units are
/// sorted by region start and pairwise non-overlapping; every surviving
/// input region is covered by exactly one unit; the same input always
/// produces the same boundaries.
pub fn partition(
    audio: &Arc<AudioBuffer>,
    regions: &[SpeechRegion],
    config: &PartitionConfig,
    worker_count: usize,
) -> Vec<WorkUnit> {
    let mut spans: Vec<SpeechRegion> = Vec::new();
    let mut current: Option<SpeechRegion> = None;

    for region in regions {
        if region.duration_s() < config.min_region_s {
            continue;
        }

        match current.as_mut() {
            None => current = Some(*region),
            Some(span) => {
                // Concatenating must not push the unit past the upper
                // bound. A lone region past the bound is tolerated as
                // the one oversize exception: the detector already
                // split at every usable silence, so there is nothing
                // left to split at.
                if region.end_s - span.start_s > config.max_unit_s {
                    spans.push(*span);
                    current = Some(*region);
                } else {
                    span.end_s = region.end_s;
                }
            }
        }
    }
    if let Some(span) = current {
        spans.push(span);
    }

    if spans.len() < worker_count {
        // Fewer units than workers: leave workers idle rather than
        // manufacture sub-minimum units; startup overhead dominates at
        // short durations.
        debug!(
            "{} unit(s) for {} worker(s); leaving {} idle",
            spans.len(),
            worker_count,
            worker_count - spans.len()
        );
    }

    spans
        .into_iter()
        .enumerate()
        .map(|(i, region)| WorkUnit::new(i as u64, region, Arc::clone(audio)))
        .collect()
}
