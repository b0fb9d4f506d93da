use statsrelay_statsd::{CounterMetric, HistogramMetric, TimerMetric};

/// Counter metrics used by the statsrelay server.
pub enum ServerCounters {
    /// Number of UDP datagrams received by the statsd listener.
    DatagramsReceived,

    /// Number of TCP connections accepted by the statsd listener.
    TcpConnectionsAccepted,

    /// Number of samples parsed from received lines.
    ///
    /// This metric is tagged with:
    ///  - `transport`: Either `udp` or `tcp`.
    SamplesReceived,

    /// Number of lines or samples that were discarded.
    ///
    /// This metric is tagged with:
    ///  - `reason`: Either `parse` for malformed lines, `rule` for samples removed by an input
    ///    rule, or `aggregate` for samples refused by the aggregator.
    SamplesRejected,

    /// Number of monitor messages answered by a listener.
    MonitorRequests,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::DatagramsReceived => "server.datagrams.received",
            Self::TcpConnectionsAccepted => "server.tcp.accepted",
            Self::SamplesReceived => "server.samples.received",
            Self::SamplesRejected => "server.samples.rejected",
            Self::MonitorRequests => "server.monitor.requests",
        }
    }
}

/// Histogram metrics used by the statsrelay server.
pub enum ServerHistograms {
    /// Size of received UDP datagrams in bytes.
    DatagramSize,

    /// Number of datapoints routed to destinations per flush.
    RoutedDatapoints,
}

impl HistogramMetric for ServerHistograms {
    fn name(&self) -> &'static str {
        match self {
            Self::DatagramSize => "server.datagrams.size",
            Self::RoutedDatapoints => "server.flush.routed",
        }
    }
}

/// Timer metrics used by the statsrelay server.
pub enum ServerTimers {
    /// Total time spent in a flush, including routing of the datapoints.
    FlushDuration,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::FlushDuration => "server.flush.duration",
        }
    }
}
