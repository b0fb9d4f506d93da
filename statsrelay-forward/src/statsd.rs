use statsrelay_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics for datapoint forwarding.
pub enum ForwardCounters {
    /// Number of datapoints admitted into a send queue.
    ///
    /// Tagged by `destination`.
    DatapointsQueued,

    /// Number of datapoints written to a destination.
    ///
    /// Tagged by `destination`.
    DatapointsSent,

    /// Number of datapoints dropped before they were written.
    ///
    /// This metric is tagged with:
    ///  - `destination`: The destination node.
    ///  - `reason`: One of `queue_full`, `backpressure`, `unserializable` or `discarded`.
    DatapointsDropped,

    /// Number of datapoints put back into a queue after a failed send.
    DatapointsRequeued,

    /// Number of connection state transitions.
    ///
    /// This metric is tagged with:
    ///  - `destination`: The destination node.
    ///  - `state`: The new state.
    ConnectionState,

    /// Number of ring rebuilds.
    RingRebuilt,
}

impl CounterMetric for ForwardCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::DatapointsQueued => "forward.datapoints.queued",
            Self::DatapointsSent => "forward.datapoints.sent",
            Self::DatapointsDropped => "forward.datapoints.dropped",
            Self::DatapointsRequeued => "forward.datapoints.requeued",
            Self::ConnectionState => "forward.connection.state",
            Self::RingRebuilt => "forward.ring.rebuilt",
        }
    }
}

/// Gauge metrics for datapoint forwarding.
pub enum ForwardGauges {
    /// The number of datapoints waiting in the send queue of a destination.
    QueueDepth,
}

impl GaugeMetric for ForwardGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::QueueDepth => "forward.queue.depth",
        }
    }
}

/// Histogram metrics for datapoint forwarding.
pub enum ForwardHistograms {
    /// The number of datapoints in a payload written to a destination.
    BatchSize,

    /// The size of a payload written to a destination in bytes.
    PayloadSize,
}

impl HistogramMetric for ForwardHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::BatchSize => "forward.batch.datapoints",
            Self::PayloadSize => "forward.batch.bytes",
        }
    }
}

/// Timer metrics for datapoint forwarding.
pub enum ForwardTimers {
    /// Time spent writing a single payload to the transport.
    SendDuration,
}

impl TimerMetric for ForwardTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::SendDuration => "forward.send.duration",
        }
    }
}
