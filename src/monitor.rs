//! Operation timing monitor.
//!
//! Accumulates timing samples for cache and data-fetch operations in a
//! bounded ring, keeps a separate ring of slow samples, and offers an advisory
//! repetition detector for N+1-style access patterns. Nothing here ever blocks
//! or alters the operations being measured.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::histogram;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::warn;

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "monitor";
const METRIC_OPERATION_MS: &str = "concierge_operation_ms";

const DEFAULT_SLOW_THRESHOLD_MS: u64 = 500;
const DEFAULT_SAMPLE_LIMIT: usize = 1000;
const DEFAULT_SLOW_SAMPLE_LIMIT: usize = 100;
const DEFAULT_SLOW_REPORT_LIMIT: usize = 10;
const DEFAULT_REPETITION_THRESHOLD: usize = 10;
const DEFAULT_REPETITION_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Where an operation's result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleSource {
    CacheHit,
    CacheMiss,
    Direct,
}

impl SampleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache-hit",
            Self::CacheMiss => "cache-miss",
            Self::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSample {
    pub name: String,
    pub duration_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub outcome: Outcome,
    pub source: SampleSource,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Samples at or above this duration are retained as slow.
    pub slow_threshold: Duration,
    /// Capacity of the main sample ring.
    pub sample_limit: usize,
    /// Capacity of the slow sample ring.
    pub slow_sample_limit: usize,
    /// Number of slow samples included in [`MonitorStats`].
    pub slow_report_limit: usize,
    /// Repetitions of one name within the window that raise an alert.
    pub repetition_threshold: usize,
    /// Number of most recent samples inspected for repetition.
    pub repetition_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_millis(DEFAULT_SLOW_THRESHOLD_MS),
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            slow_sample_limit: DEFAULT_SLOW_SAMPLE_LIMIT,
            slow_report_limit: DEFAULT_SLOW_REPORT_LIMIT,
            repetition_threshold: DEFAULT_REPETITION_THRESHOLD,
            repetition_window: DEFAULT_REPETITION_WINDOW,
        }
    }
}

impl From<&crate::config::MonitorSettings> for MonitorConfig {
    fn from(settings: &crate::config::MonitorSettings) -> Self {
        Self {
            slow_threshold: settings.slow_threshold,
            sample_limit: settings.sample_limit.get(),
            slow_sample_limit: settings.slow_sample_limit.get(),
            slow_report_limit: settings.slow_report_limit.get(),
            repetition_threshold: settings.repetition_threshold.get(),
            repetition_window: settings.repetition_window.get(),
        }
    }
}

/// Aggregates over the retained samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStats {
    /// Samples recorded over the monitor's lifetime.
    pub recorded_total: u64,
    /// Samples currently retained in the ring.
    pub sample_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub mean_duration_ms: f64,
    pub cache_hit_count: usize,
    /// Most recent slow samples, newest first.
    pub slow_samples: Vec<OperationSample>,
}

/// A name repeated often enough to suggest an N+1 access pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepetitionAlert {
    pub name: String,
    pub count: usize,
}

pub struct OperationMonitor {
    config: MonitorConfig,
    samples: Mutex<VecDeque<OperationSample>>,
    slow: Mutex<VecDeque<OperationSample>>,
    recorded_total: AtomicU64,
}

impl OperationMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(config.sample_limit.min(4096))),
            slow: Mutex::new(VecDeque::new()),
            recorded_total: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Append a sample, dropping the oldest once the ring is full.
    pub fn record(
        &self,
        name: impl Into<String>,
        duration: Duration,
        outcome: Outcome,
        source: SampleSource,
    ) {
        let sample = OperationSample {
            name: name.into(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            timestamp: OffsetDateTime::now_utc(),
            outcome,
            source,
        };

        histogram!(METRIC_OPERATION_MS, "source" => source.as_str()).record(sample.duration_ms);
        self.recorded_total.fetch_add(1, Ordering::Relaxed);

        if duration >= self.config.slow_threshold {
            warn!(
                operation = %sample.name,
                duration_ms = sample.duration_ms,
                source = source.as_str(),
                outcome = ?outcome,
                "Slow operation"
            );
            push_bounded(
                &mut mutex_lock(&self.slow, SOURCE, "record.slow"),
                sample.clone(),
                self.config.slow_sample_limit,
            );
        }

        push_bounded(
            &mut mutex_lock(&self.samples, SOURCE, "record"),
            sample,
            self.config.sample_limit,
        );
    }

    /// Time `operation` and record it as a direct (uncached) access.
    pub async fn time<T, E, Fut>(&self, name: &str, operation: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = operation.await;
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.record(name, started.elapsed(), outcome, SampleSource::Direct);
        result
    }

    pub fn stats(&self) -> MonitorStats {
        let samples = mutex_lock(&self.samples, SOURCE, "stats");
        let sample_count = samples.len();
        let success_count = samples
            .iter()
            .filter(|sample| sample.outcome == Outcome::Success)
            .count();
        let failure_count = sample_count - success_count;
        let cache_hit_count = samples
            .iter()
            .filter(|sample| sample.source == SampleSource::CacheHit)
            .count();
        let total_ms: f64 = samples.iter().map(|sample| sample.duration_ms).sum();
        drop(samples);

        let ratio = |count: usize| {
            if sample_count == 0 {
                0.0
            } else {
                count as f64 / sample_count as f64
            }
        };

        MonitorStats {
            recorded_total: self.recorded_total.load(Ordering::Relaxed),
            sample_count,
            success_count,
            failure_count,
            success_rate: ratio(success_count),
            failure_rate: ratio(failure_count),
            mean_duration_ms: if sample_count == 0 {
                0.0
            } else {
                total_ms / sample_count as f64
            },
            cache_hit_count,
            slow_samples: self.slow_samples(self.config.slow_report_limit),
        }
    }

    /// Up to `limit` most recent slow samples, newest first.
    pub fn slow_samples(&self, limit: usize) -> Vec<OperationSample> {
        mutex_lock(&self.slow, SOURCE, "slow_samples")
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Up to `limit` most recent samples, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<OperationSample> {
        let samples = mutex_lock(&self.samples, SOURCE, "recent");
        let skip = samples.len().saturating_sub(limit);
        samples.iter().skip(skip).cloned().collect()
    }

    /// Run the repetition detector over the configured window.
    pub fn detect_repetition(&self) -> Vec<RepetitionAlert> {
        let window = self.recent(self.config.repetition_window);
        let alerts = detect_repetition(&window, self.config.repetition_threshold);
        for alert in &alerts {
            warn!(
                operation = %alert.name,
                count = alert.count,
                window = self.config.repetition_window,
                "Repeated operation, possible N+1 access pattern"
            );
        }
        alerts
    }

    pub fn clear(&self) {
        mutex_lock(&self.samples, SOURCE, "clear").clear();
        mutex_lock(&self.slow, SOURCE, "clear.slow").clear();
    }
}

/// Group `samples` by name and flag names seen more than `threshold` times.
///
/// Alerts are ordered by descending count, then name.
pub fn detect_repetition(samples: &[OperationSample], threshold: usize) -> Vec<RepetitionAlert> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for sample in samples {
        *counts.entry(sample.name.as_str()).or_default() += 1;
    }

    let mut alerts: Vec<RepetitionAlert> = counts
        .into_iter()
        .filter(|(_, count)| *count > threshold)
        .map(|(name, count)| RepetitionAlert {
            name: name.to_string(),
            count,
        })
        .collect();
    alerts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    alerts
}

fn push_bounded(ring: &mut VecDeque<OperationSample>, sample: OperationSample, limit: usize) {
    let limit = limit.max(1);
    while ring.len() >= limit {
        ring.pop_front();
    }
    ring.push_back(sample);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(config: MonitorConfig) -> OperationMonitor {
        OperationMonitor::new(config)
    }

    #[test]
    fn ring_drops_oldest_samples() {
        let monitor = monitor(MonitorConfig {
            sample_limit: 3,
            ..Default::default()
        });
        for name in ["a", "b", "c", "d"] {
            monitor.record(name, Duration::from_millis(1), Outcome::Success, SampleSource::Direct);
        }

        let names: Vec<String> = monitor.recent(10).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "c", "d"]);
        let stats = monitor.stats();
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.recorded_total, 4);
    }

    #[test]
    fn stats_compute_rates_and_mean() {
        let monitor = monitor(MonitorConfig::default());
        monitor.record("q", Duration::from_millis(10), Outcome::Success, SampleSource::CacheHit);
        monitor.record("q", Duration::from_millis(20), Outcome::Success, SampleSource::CacheMiss);
        monitor.record("q", Duration::from_millis(30), Outcome::Success, SampleSource::Direct);
        monitor.record("q", Duration::from_millis(40), Outcome::Failure, SampleSource::Direct);

        let stats = monitor.stats();
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
        assert!((stats.failure_rate - 0.25).abs() < f64::EPSILON);
        assert!((stats.mean_duration_ms - 25.0).abs() < 1e-9);
        assert_eq!(stats.cache_hit_count, 1);
        assert!(stats.slow_samples.is_empty());
    }

    #[test]
    fn empty_monitor_reports_zeroes() {
        let stats = monitor(MonitorConfig::default()).stats();
        assert_eq!(stats.sample_count, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.mean_duration_ms, 0.0);
    }

    #[test]
    fn slow_samples_are_bounded_and_newest_first() {
        let monitor = monitor(MonitorConfig {
            slow_threshold: Duration::from_millis(100),
            slow_sample_limit: 2,
            slow_report_limit: 5,
            ..Default::default()
        });
        monitor.record("fast", Duration::from_millis(5), Outcome::Success, SampleSource::Direct);
        for name in ["slow-1", "slow-2", "slow-3"] {
            monitor.record(name, Duration::from_millis(150), Outcome::Success, SampleSource::Direct);
        }

        let slow: Vec<String> = monitor
            .stats()
            .slow_samples
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(slow, vec!["slow-3", "slow-2"]);
    }

    #[test]
    fn repetition_over_threshold_is_flagged() {
        let monitor = monitor(MonitorConfig {
            repetition_threshold: 3,
            repetition_window: 10,
            ..Default::default()
        });
        for _ in 0..5 {
            monitor.record(
                "relations:booking",
                Duration::from_millis(2),
                Outcome::Success,
                SampleSource::CacheMiss,
            );
        }
        for _ in 0..3 {
            monitor.record("page:rooms", Duration::from_millis(2), Outcome::Success, SampleSource::Direct);
        }

        let alerts = monitor.detect_repetition();
        assert_eq!(
            alerts,
            vec![RepetitionAlert {
                name: "relations:booking".to_string(),
                count: 5,
            }]
        );
    }

    #[test]
    fn repetition_only_inspects_the_window() {
        let monitor = monitor(MonitorConfig {
            repetition_threshold: 2,
            repetition_window: 3,
            ..Default::default()
        });
        for _ in 0..5 {
            monitor.record("old", Duration::from_millis(1), Outcome::Success, SampleSource::Direct);
        }
        for name in ["x", "y", "z"] {
            monitor.record(name, Duration::from_millis(1), Outcome::Success, SampleSource::Direct);
        }

        assert!(monitor.detect_repetition().is_empty());
    }

    #[tokio::test]
    async fn time_records_direct_outcome() {
        let monitor = monitor(MonitorConfig::default());
        let ok: Result<u8, &str> = monitor.time("fetch", async { Ok(1) }).await;
        let err: Result<u8, &str> = monitor.time("fetch", async { Err("down") }).await;

        assert_eq!(ok, Ok(1));
        assert_eq!(err, Err("down"));
        let samples = monitor.recent(2);
        assert_eq!(samples[0].outcome, Outcome::Success);
        assert_eq!(samples[1].outcome, Outcome::Failure);
        assert!(samples.iter().all(|s| s.source == SampleSource::Direct));
    }
}
