//! Timing and throughput statistics of the semantic pipeline.
//!
//! Workers record into a shared [`SemanticStats`]; callers read a
//! [`SemanticStatsSummary`] or export every sample with
//! [`SemanticStats::write_csv`] once the pipeline has stopped.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct StatsInner {
    mask_generation: Vec<f64>,
    probability_update: Vec<f64>,
    semantic_optimization: Vec<f64>,
    semantic_ba: Vec<f64>,
    semantic_delay: Vec<u64>,
    segmented: usize,
    rerouted: usize,
    failed: usize,
    dropped_batches: usize,
    missing_keyframes: usize,
}

/// Shared statistics sink. All durations are stored in seconds.
#[derive(Debug, Default)]
pub struct SemanticStats {
    inner: Mutex<StatsInner>,
}

/// Aggregated view of [`SemanticStats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SemanticStatsSummary {
    /// KeyFrames labeled by the segmentation service.
    pub segmented: usize,
    /// KeyFrames that were already labeled when drained.
    pub rerouted: usize,
    /// KeyFrames whose label or mask could not be produced.
    pub failed: usize,
    /// Batches dropped on a service contract violation.
    pub dropped_batches: usize,
    /// Handles whose keyframe was erased before processing.
    pub missing_keyframes: usize,
    pub semantic_optimizations: usize,
    pub mean_mask_generation_ms: f64,
    pub mean_probability_update_ms: f64,
    pub mean_semantic_optimization_ms: f64,
    /// Mean number of keyframes inserted after a keyframe by the time its
    /// label was applied.
    pub mean_semantic_delay: f64,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    metric: &'a str,
    index: usize,
    value: f64,
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

impl SemanticStats {
    pub fn record_mask_generation(&self, elapsed: Duration) {
        self.inner.lock().mask_generation.push(elapsed.as_secs_f64());
    }

    pub fn record_probability_update(&self, elapsed: Duration) {
        self.inner.lock().probability_update.push(elapsed.as_secs_f64());
    }

    pub fn record_semantic_optimization(&self, elapsed: Duration) {
        self.inner
            .lock()
            .semantic_optimization
            .push(elapsed.as_secs_f64());
    }

    pub fn record_semantic_ba(&self, elapsed: Duration) {
        self.inner.lock().semantic_ba.push(elapsed.as_secs_f64());
    }

    pub fn record_segmented(&self, delay_keyframes: u64) {
        let mut inner = self.inner.lock();
        inner.segmented += 1;
        inner.semantic_delay.push(delay_keyframes);
    }

    pub fn record_rerouted(&self) {
        self.inner.lock().rerouted += 1;
    }

    pub fn record_failure(&self) {
        self.inner.lock().failed += 1;
    }

    pub fn record_dropped_batch(&self) {
        self.inner.lock().dropped_batches += 1;
    }

    pub fn record_missing_keyframe(&self) {
        self.inner.lock().missing_keyframes += 1;
    }

    pub fn summary(&self) -> SemanticStatsSummary {
        let inner = self.inner.lock();
        let delays: Vec<f64> = inner.semantic_delay.iter().map(|&d| d as f64).collect();
        SemanticStatsSummary {
            segmented: inner.segmented,
            rerouted: inner.rerouted,
            failed: inner.failed,
            dropped_batches: inner.dropped_batches,
            missing_keyframes: inner.missing_keyframes,
            semantic_optimizations: inner.semantic_optimization.len(),
            mean_mask_generation_ms: mean(&inner.mask_generation) * 1000.0,
            mean_probability_update_ms: mean(&inner.probability_update) * 1000.0,
            mean_semantic_optimization_ms: mean(&inner.semantic_optimization) * 1000.0,
            mean_semantic_delay: mean(&delays),
        }
    }

    /// Write every recorded sample as `metric,index,value` rows.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {:?}", path))?;

        let inner = self.inner.lock();
        let delays: Vec<f64> = inner.semantic_delay.iter().map(|&d| d as f64).collect();
        let series: [(&str, &[f64]); 5] = [
            ("mask_generation_s", &inner.mask_generation),
            ("probability_update_s", &inner.probability_update),
            ("semantic_optimization_s", &inner.semantic_optimization),
            ("semantic_ba_s", &inner.semantic_ba),
            ("semantic_delay_keyframes", &delays),
        ];
        for (metric, samples) in series {
            for (index, &value) in samples.iter().enumerate() {
                writer.serialize(CsvRow {
                    metric,
                    index,
                    value,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Display for SemanticStatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "segmented keyframes:      {}", self.segmented)?;
        writeln!(f, "re-routed keyframes:      {}", self.rerouted)?;
        writeln!(f, "failed keyframes:         {}", self.failed)?;
        writeln!(f, "dropped batches:          {}", self.dropped_batches)?;
        writeln!(f, "semantic optimizations:   {}", self.semantic_optimizations)?;
        writeln!(f, "mask generation:          {:.3} ms", self.mean_mask_generation_ms)?;
        writeln!(f, "probability update:       {:.3} ms", self.mean_probability_update_ms)?;
        writeln!(f, "semantic optimization:    {:.3} ms", self.mean_semantic_optimization_ms)?;
        write!(f, "semantic delay:           {:.2} keyframes", self.mean_semantic_delay)
    }
}
