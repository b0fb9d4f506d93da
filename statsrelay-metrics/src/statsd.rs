use statsrelay_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics for the aggregator.
pub enum MetricCounters {
    /// Incremented for every sample recorded into the aggregator.
    ///
    /// Tagged by `kind`.
    SamplesRecorded,

    /// Incremented for every sample the aggregator refused, such as a non-finite value.
    SamplesRejected,

    /// Incremented for every metric forgotten after too many idle windows.
    StatesEvicted,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::SamplesRecorded => "aggregator.samples.recorded",
            Self::SamplesRejected => "aggregator.samples.rejected",
            Self::StatesEvicted => "aggregator.states.evicted",
        }
    }
}

/// Gauge metrics for the aggregator.
pub enum MetricGauges {
    /// The number of metric names tracked after a flush.
    TrackedMetrics,
}

impl GaugeMetric for MetricGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::TrackedMetrics => "aggregator.states.tracked",
        }
    }
}

/// Histogram metrics for the aggregator.
pub enum MetricHistograms {
    /// The number of datapoints produced by a single flush.
    DatapointsFlushed,
}

impl HistogramMetric for MetricHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::DatapointsFlushed => "aggregator.flush.datapoints",
        }
    }
}

/// Timer metrics for the aggregator.
pub enum MetricTimers {
    /// Time spent capturing and resetting the window during a flush.
    FlushDuration,
}

impl TimerMetric for MetricTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "aggregator.flush.duration",
        }
    }
}
