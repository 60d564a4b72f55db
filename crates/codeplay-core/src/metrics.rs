//! Execution metrics.
//!
//! The dispatcher reports one [`ExecutionSample`] per request to a
//! [`MetricsSink`]. Sinks must be cheap and must not block; anything slow
//! belongs behind a channel in the sink itself.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core_types::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSample {
    pub language: Language,
    pub duration: Duration,
    pub success: bool,
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, sample: &ExecutionSample);

    /// Current totals, for sinks that keep any.
    fn snapshot(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Logs every sample at info level.
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record(&self, sample: &ExecutionSample) {
        log::info!(
            "execution language={} duration_ms={} success={}",
            sample.language,
            sample.duration.as_millis(),
            sample.success
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LanguageStats {
    pub executions: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl LanguageStats {
    pub fn average_duration_ms(&self) -> u64 {
        if self.executions == 0 {
            0
        } else {
            self.total_duration_ms / self.executions
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub executions: u64,
    pub failures: u64,
    pub per_language: BTreeMap<Language, LanguageStats>,
}

/// Keeps running totals per language.
#[derive(Default)]
pub struct InMemoryMetrics {
    totals: RwLock<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, sample: &ExecutionSample) {
        let Ok(mut totals) = self.totals.write() else {
            log::warn!("Metrics lock poisoned, dropping sample");
            return;
        };
        let duration_ms = sample.duration.as_millis() as u64;
        totals.executions += 1;
        if !sample.success {
            totals.failures += 1;
        }
        let stats = totals.per_language.entry(sample.language).or_default();
        stats.executions += 1;
        if !sample.success {
            stats.failures += 1;
        }
        stats.total_duration_ms += duration_ms;
        stats.max_duration_ms = stats.max_duration_ms.max(duration_ms);
    }

    fn snapshot(&self) -> Option<MetricsSnapshot> {
        self.totals.read().ok().map(|totals| totals.clone())
    }
}

/// Forwards each sample to several sinks. The snapshot comes from the first
/// sink that has one.
pub struct FanoutMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutMetrics {
    fn record(&self, sample: &ExecutionSample) {
        for sink in &self.sinks {
            sink.record(sample);
        }
    }

    fn snapshot(&self) -> Option<MetricsSnapshot> {
        self.sinks.iter().find_map(|sink| sink.snapshot())
    }
}
