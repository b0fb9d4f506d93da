//! Windowed aggregation of samples into datapoints.

use std::time::Instant;

use hashbrown::HashMap;
use statsrelay_statsd::metric;

use crate::statsd::{MetricCounters, MetricGauges, MetricHistograms, MetricTimers};
use crate::{Datapoint, MetricKind, Sample, UnixTimestamp};

mod config;

pub use self::config::*;

/// An error returned when a sample cannot be recorded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AggregateError {
    /// The sample's value is NaN or infinite.
    #[error("sample value is not finite")]
    NonFiniteValue,
    /// The sample rate is not within `(0, 1]`.
    #[error("sample rate out of range")]
    InvalidSampleRate,
    /// The sample's name cannot be forwarded.
    #[error("invalid metric name")]
    InvalidName,
}

/// Counts of what the aggregator did since it was created.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AggregatorStats {
    /// Samples successfully recorded.
    pub samples_recorded: u64,
    /// Samples refused by [`Aggregator::record`].
    pub samples_rejected: u64,
    /// Datapoints returned from all flushes.
    pub datapoints_flushed: u64,
    /// Metrics forgotten after exceeding the idle window limit.
    pub states_evicted: u64,
    /// Metrics currently tracked.
    pub tracked_metrics: u64,
}

#[derive(Debug, Default)]
struct TimerValues {
    values: Vec<f64>,
    count: f64,
}

#[derive(Debug)]
enum StateValue {
    Counter(f64),
    Gauge(f64),
    Timer(TimerValues),
}

/// Per-metric accumulation state, reset on every flush.
#[derive(Debug)]
struct AggregationState {
    value: StateValue,
    /// Samples recorded since the last flush.
    samples: u64,
    /// Consecutive flushes without samples.
    idle_windows: u32,
}

impl AggregationState {
    fn new(kind: MetricKind) -> Self {
        let value = match kind {
            MetricKind::Counter => StateValue::Counter(0.0),
            MetricKind::Gauge => StateValue::Gauge(0.0),
            MetricKind::Timer => StateValue::Timer(TimerValues::default()),
        };

        Self {
            value,
            samples: 0,
            idle_windows: 0,
        }
    }

    fn kind(&self) -> MetricKind {
        match self.value {
            StateValue::Counter(_) => MetricKind::Counter,
            StateValue::Gauge(_) => MetricKind::Gauge,
            StateValue::Timer(_) => MetricKind::Timer,
        }
    }

    fn insert(&mut self, value: f64, sample_rate: f64) {
        match &mut self.value {
            StateValue::Counter(sum) => *sum += value / sample_rate,
            StateValue::Gauge(last) => *last = value,
            StateValue::Timer(timer) => {
                timer.values.push(value);
                timer.count += 1.0 / sample_rate;
            }
        }

        self.samples += 1;
        self.idle_windows = 0;
    }
}

/// Emits datapoints for one flush, sharing name prefix and timestamp.
struct Report<'a> {
    prefix: &'a str,
    timestamp: UnixTimestamp,
    datapoints: Vec<Datapoint>,
}

impl Report<'_> {
    fn push(&mut self, name: &str, suffix: &str, value: f64) {
        self.datapoints.push(Datapoint {
            name: format!("{}{name}{suffix}", self.prefix),
            value,
            timestamp: self.timestamp,
        });
    }

    fn push_timer(&mut self, name: &str, timer: &mut TimerValues, percentiles: &[f64]) {
        let mut values = std::mem::take(&mut timer.values);
        values.sort_unstable_by(f64::total_cmp);

        let count = std::mem::take(&mut timer.count);
        self.push(name, ".count", count);

        let (Some(&lower), Some(&upper)) = (values.first(), values.last()) else {
            return;
        };

        let len = values.len();
        let mean = values.iter().sum::<f64>() / len as f64;
        self.push(name, ".lower", lower);
        self.push(name, ".upper", upper);
        self.push(name, ".mean", mean);

        for percentile in percentiles {
            let index = ((percentile / 100.0) * len as f64).round() as usize;
            let value = values[index.clamp(1, len) - 1];
            let label = percentile.to_string().replace('.', "_");
            self.push(name, &format!(".upper_{label}"), value);
        }
    }
}

/// Accumulates samples per metric name and turns them into datapoints on flush.
///
/// The aggregator is owned by a single task that serializes [`record`](Self::record) and
/// [`flush`](Self::flush). A flush captures and resets every state in one step, so each sample is
/// attributed to exactly one window.
///
/// # Example
///
/// ```
/// use statsrelay_metrics::aggregator::{Aggregator, AggregatorConfig};
/// use statsrelay_metrics::{Sample, MetricKind, UnixTimestamp};
///
/// let mut aggregator = Aggregator::new(AggregatorConfig::default());
/// aggregator.record(Sample::new("foo", 1.0, MetricKind::Counter)).unwrap();
/// aggregator.record(Sample::new("foo", 2.0, MetricKind::Counter)).unwrap();
///
/// let datapoints = aggregator.flush(UnixTimestamp::from_secs(1700000000));
/// assert_eq!(datapoints[0].to_string(), "foo 3 1700000000");
/// ```
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    prefix: String,
    states: HashMap<String, AggregationState>,
    stats: AggregatorStats,
    window_samples: u64,
}

impl Aggregator {
    /// Creates a new aggregator with the given configuration.
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            prefix: config.name_prefix(),
            config,
            states: HashMap::new(),
            stats: AggregatorStats::default(),
            window_samples: 0,
        }
    }

    /// Returns the configuration of this aggregator.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Returns the number of metrics currently tracked.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns `true` if no metrics are tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Returns a snapshot of the aggregator's counters.
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            tracked_metrics: self.states.len() as u64,
            ..self.stats
        }
    }

    /// Adds a sample to the state of its metric, creating the state if needed.
    ///
    /// A sample whose kind differs from the tracked state replaces that state.
    pub fn record(&mut self, sample: Sample) -> Result<(), AggregateError> {
        let result = self.record_inner(sample);
        match result {
            Ok(()) => {
                self.stats.samples_recorded += 1;
                self.window_samples += 1;
            }
            Err(_) => self.stats.samples_rejected += 1,
        }
        result
    }

    fn record_inner(&mut self, sample: Sample) -> Result<(), AggregateError> {
        let Sample {
            name,
            value,
            kind,
            sample_rate,
        } = sample;

        if !value.is_finite() {
            return Err(AggregateError::NonFiniteValue);
        }
        if !(sample_rate > 0.0 && sample_rate <= 1.0) {
            return Err(AggregateError::InvalidSampleRate);
        }
        if !crate::is_valid_name(&name) {
            return Err(AggregateError::InvalidName);
        }

        match self.states.get_mut(name.as_str()) {
            Some(state) if state.kind() == kind => state.insert(value, sample_rate),
            Some(state) => {
                statsrelay_log::debug!(metric = name.as_str(), %kind, "metric changed its kind");
                *state = AggregationState::new(kind);
                state.insert(value, sample_rate);
            }
            None => {
                let mut state = AggregationState::new(kind);
                state.insert(value, sample_rate);
                self.states.insert(name, state);
            }
        }

        Ok(())
    }

    /// Captures and resets the state of all metrics and returns their datapoints.
    ///
    /// All datapoints carry the timestamp `now`. Metrics without samples in this window are
    /// omitted, unless [`report_idle_as_zero`](AggregatorConfig::report_idle_as_zero) is set.
    /// Metrics idle for more than [`max_idle_windows`](AggregatorConfig::max_idle_windows) are
    /// evicted.
    pub fn flush(&mut self, now: UnixTimestamp) -> Vec<Datapoint> {
        let start = Instant::now();

        let mut report = Report {
            prefix: &self.prefix,
            timestamp: now,
            datapoints: Vec::with_capacity(self.states.len()),
        };

        let config = &self.config;
        let mut evicted = 0;

        self.states.retain(|name, state| {
            if state.samples == 0 {
                state.idle_windows += 1;
                if state.idle_windows > config.max_idle_windows {
                    evicted += 1;
                    return false;
                }

                if config.report_idle_as_zero {
                    match &state.value {
                        StateValue::Counter(_) => report.push(name, "", 0.0),
                        StateValue::Gauge(last) => report.push(name, "", *last),
                        StateValue::Timer(_) => report.push(name, ".count", 0.0),
                    }
                }

                return true;
            }

            match &mut state.value {
                StateValue::Counter(sum) => report.push(name, "", std::mem::take(sum)),
                StateValue::Gauge(last) => report.push(name, "", *last),
                StateValue::Timer(timer) => {
                    report.push_timer(name, timer, &config.timer_percentiles)
                }
            }

            state.samples = 0;
            true
        });

        let datapoints = report.datapoints;

        self.stats.datapoints_flushed += datapoints.len() as u64;
        self.stats.states_evicted += evicted;

        metric!(timer(MetricTimers::FlushDuration) = start.elapsed());
        metric!(histogram(MetricHistograms::DatapointsFlushed) = datapoints.len());
        metric!(counter(MetricCounters::SamplesRecorded) += std::mem::take(&mut self.window_samples));
        metric!(counter(MetricCounters::StatesEvicted) += evicted);
        metric!(gauge(MetricGauges::TrackedMetrics) = self.states.len());

        if self.config.dump_mode {
            for datapoint in &datapoints {
                statsrelay_log::info!("Out: {datapoint}");
            }
        }

        datapoints
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const NOW: UnixTimestamp = UnixTimestamp::from_secs(1700000000);

    fn flush_sorted(aggregator: &mut Aggregator, now: UnixTimestamp) -> Vec<(String, f64)> {
        let mut datapoints: Vec<_> = aggregator
            .flush(now)
            .into_iter()
            .inspect(|d| assert_eq!(d.timestamp, now))
            .map(|d| (d.name, d.value))
            .collect();
        datapoints.sort_by(|a, b| a.0.cmp(&b.0));
        datapoints
    }

    fn counter(name: &str, value: f64) -> Sample {
        Sample::new(name, value, MetricKind::Counter)
    }

    #[test]
    fn test_counter_sums_values() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        for result in Sample::parse_all(b"foo:1|c\nfoo:1|c\nfoo:1|c\nfoo:1|c\nfoo:1|c") {
            aggregator.record(result.unwrap()).unwrap();
        }

        let datapoints = aggregator.flush(NOW);
        assert_eq!(datapoints, vec![Datapoint::new("foo", 5.0, NOW)]);
    }

    #[test]
    fn test_counter_scales_by_sample_rate() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.record(counter("foo", 1.0).with_sample_rate(0.5)).unwrap();
        aggregator.record(counter("foo", 3.0).with_sample_rate(0.25)).unwrap();
        aggregator.record(counter("foo", 2.0)).unwrap();

        assert_eq!(flush_sorted(&mut aggregator, NOW), [("foo".to_owned(), 16.0)]);
    }

    #[test]
    fn test_gauge_last_value_wins() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        for value in [3.0, 7.0, 5.0] {
            aggregator
                .record(Sample::new("load", value, MetricKind::Gauge))
                .unwrap();
        }

        assert_eq!(flush_sorted(&mut aggregator, NOW), [("load".to_owned(), 5.0)]);
    }

    #[test]
    fn test_timer_summary() {
        let mut aggregator = Aggregator::new(AggregatorConfig {
            timer_percentiles: vec![90.0, 99.5],
            ..Default::default()
        });

        for value in [7.0, 1.0, 10.0, 4.0, 2.0, 9.0, 3.0, 6.0, 5.0, 8.0] {
            aggregator
                .record(Sample::new("db.query", value, MetricKind::Timer))
                .unwrap();
        }

        insta::assert_debug_snapshot!(flush_sorted(&mut aggregator, NOW), @r###"
        [
            (
                "db.query.count",
                10.0,
            ),
            (
                "db.query.lower",
                1.0,
            ),
            (
                "db.query.mean",
                5.5,
            ),
            (
                "db.query.upper",
                10.0,
            ),
            (
                "db.query.upper_90",
                9.0,
            ),
            (
                "db.query.upper_99_5",
                10.0,
            ),
        ]
        "###);
    }

    #[test]
    fn test_timer_count_uses_sample_rate() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator
            .record(Sample::new("t", 20.0, MetricKind::Timer).with_sample_rate(0.1))
            .unwrap();

        let datapoints = flush_sorted(&mut aggregator, NOW);
        assert_eq!(datapoints[0], ("t.count".to_owned(), 10.0));
        assert_eq!(datapoints[4], ("t.upper_90".to_owned(), 20.0));
    }

    #[test]
    fn test_flush_resets_window() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.record(counter("foo", 2.0)).unwrap();

        assert_eq!(aggregator.flush(NOW).len(), 1);
        assert!(aggregator.flush(NOW).is_empty());

        aggregator.record(counter("foo", 3.0)).unwrap();
        assert_eq!(flush_sorted(&mut aggregator, NOW), [("foo".to_owned(), 3.0)]);
    }

    #[test]
    fn test_idle_metrics_omitted() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.record(counter("foo", 1.0)).unwrap();
        aggregator.record(counter("bar", 1.0)).unwrap();
        aggregator.flush(NOW);

        aggregator.record(counter("bar", 4.0)).unwrap();
        assert_eq!(flush_sorted(&mut aggregator, NOW), [("bar".to_owned(), 4.0)]);
    }

    #[test]
    fn test_report_idle_as_zero() {
        let mut aggregator = Aggregator::new(AggregatorConfig {
            report_idle_as_zero: true,
            ..Default::default()
        });

        aggregator.record(counter("hits", 4.0)).unwrap();
        aggregator
            .record(Sample::new("load", 0.7, MetricKind::Gauge))
            .unwrap();
        aggregator
            .record(Sample::new("query", 12.0, MetricKind::Timer))
            .unwrap();
        aggregator.flush(NOW);

        assert_eq!(
            flush_sorted(&mut aggregator, NOW),
            [
                ("hits".to_owned(), 0.0),
                ("load".to_owned(), 0.7),
                ("query.count".to_owned(), 0.0),
            ]
        );
    }

    #[test]
    fn test_idle_states_evicted() {
        let mut aggregator = Aggregator::new(AggregatorConfig {
            report_idle_as_zero: true,
            max_idle_windows: 2,
            ..Default::default()
        });

        aggregator.record(counter("foo", 1.0)).unwrap();
        assert_eq!(aggregator.flush(NOW).len(), 1);
        assert_eq!(aggregator.flush(NOW).len(), 1);
        assert_eq!(aggregator.flush(NOW).len(), 1);
        assert!(aggregator.flush(NOW).is_empty());
        assert!(aggregator.is_empty());
        assert_eq!(aggregator.stats().states_evicted, 1);
    }

    #[test]
    fn test_kind_change_replaces_state() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.record(counter("foo", 5.0)).unwrap();
        aggregator
            .record(Sample::new("foo", 2.0, MetricKind::Gauge))
            .unwrap();

        assert_eq!(flush_sorted(&mut aggregator, NOW), [("foo".to_owned(), 2.0)]);
    }

    #[test]
    fn test_prefix() {
        let mut aggregator = Aggregator::new(AggregatorConfig {
            prefix: Some("statsd".to_owned()),
            ..Default::default()
        });
        aggregator.record(counter("foo", 1.0)).unwrap();

        assert_eq!(
            flush_sorted(&mut aggregator, NOW),
            [("statsd.foo".to_owned(), 1.0)]
        );
    }

    #[test]
    fn test_accepts_statsd_delimiters_in_names() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.record(counter("host:8080|requests", 2.0)).unwrap();

        let datapoints = aggregator.flush(NOW);
        assert_eq!(datapoints.len(), 1);
        assert_eq!(datapoints[0].name, "host:8080|requests");
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());

        assert_eq!(
            aggregator.record(counter("foo", f64::NAN)),
            Err(AggregateError::NonFiniteValue)
        );
        assert_eq!(
            aggregator.record(counter("foo", 1.0).with_sample_rate(0.0)),
            Err(AggregateError::InvalidSampleRate)
        );
        assert_eq!(
            aggregator.record(counter("foo bar", 1.0)),
            Err(AggregateError::InvalidName)
        );
        aggregator.record(counter("foo", 1.0)).unwrap();

        assert_eq!(
            aggregator.stats(),
            AggregatorStats {
                samples_recorded: 1,
                samples_rejected: 3,
                tracked_metrics: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_flush_emits_internal_metrics() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.record(counter("foo", 1.0)).unwrap();
        aggregator.record(counter("foo", 1.0)).unwrap();

        let captures = statsrelay_statsd::with_capturing_test_client(|| {
            aggregator.flush(NOW);
        });

        assert!(captures.contains(&"aggregator.samples.recorded:2|c".to_owned()));
        assert!(captures.contains(&"aggregator.flush.datapoints:1|h".to_owned()));
        assert!(captures.contains(&"aggregator.states.tracked:1|g".to_owned()));
    }
}
