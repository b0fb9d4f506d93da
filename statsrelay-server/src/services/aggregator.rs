use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use statsrelay_forward::{RouteSummary, Router};
use statsrelay_metrics::aggregator::{self, AggregatorConfig, AggregatorStats};
use statsrelay_metrics::rules::Rules;
use statsrelay_metrics::{Sample, UnixTimestamp};
use statsrelay_statsd::metric;
use statsrelay_system::{
    AsyncResponse, Controller, FromMessage, Interface, NoResponse, Receiver, Sender, Service,
};
use tokio::time::{Instant, Sleep};

use crate::statsd::{ServerCounters, ServerHistograms, ServerTimers};

/// Aggregator for statsd samples.
///
/// Samples are passed through the input rules and recorded into the current window. Once per
/// flush interval, the window is closed and its datapoints are handed to the [`Router`].
///
/// On shutdown, the open window is flushed a final time before the router is sealed.
#[derive(Debug)]
pub enum Aggregator {
    /// Records samples into the current window.
    RecordSamples(RecordSamples),
    /// Closes the current window ahead of schedule.
    FlushWindow(FlushWindow, Sender<RouteSummary>),
    /// Checks whether any destination still admits datapoints.
    AcceptsMetrics(AcceptsMetrics, Sender<bool>),
    /// Returns counters of the aggregator.
    GetStats(GetStats, Sender<AggregatorStats>),
}

impl Aggregator {
    /// Returns the name of the message variant.
    pub fn variant(&self) -> &'static str {
        match self {
            Aggregator::RecordSamples(_) => "RecordSamples",
            Aggregator::FlushWindow(_, _) => "FlushWindow",
            Aggregator::AcceptsMetrics(_, _) => "AcceptsMetrics",
            Aggregator::GetStats(_, _) => "GetStats",
        }
    }
}

impl Interface for Aggregator {}

/// Samples parsed by a listener, in the order they were received.
#[derive(Debug)]
pub struct RecordSamples {
    /// The parsed samples.
    pub samples: Vec<Sample>,
}

impl FromMessage<RecordSamples> for Aggregator {
    type Response = NoResponse;

    fn from_message(message: RecordSamples, _: ()) -> Self {
        Self::RecordSamples(message)
    }
}

/// Flushes the current window immediately and responds with the routing result.
///
/// The regular flush schedule is not affected.
#[derive(Debug)]
pub struct FlushWindow;

impl FromMessage<FlushWindow> for Aggregator {
    type Response = AsyncResponse<RouteSummary>;

    fn from_message(message: FlushWindow, sender: Sender<RouteSummary>) -> Self {
        Self::FlushWindow(message, sender)
    }
}

/// Responds `true` while at least one destination queue is open for new datapoints.
#[derive(Debug)]
pub struct AcceptsMetrics;

impl FromMessage<AcceptsMetrics> for Aggregator {
    type Response = AsyncResponse<bool>;

    fn from_message(message: AcceptsMetrics, sender: Sender<bool>) -> Self {
        Self::AcceptsMetrics(message, sender)
    }
}

/// Responds with a snapshot of [`AggregatorStats`].
#[derive(Debug)]
pub struct GetStats;

impl FromMessage<GetStats> for Aggregator {
    type Response = AsyncResponse<AggregatorStats>;

    fn from_message(message: GetStats, sender: Sender<AggregatorStats>) -> Self {
        Self::GetStats(message, sender)
    }
}

/// Service implementing the [`Aggregator`] interface.
pub struct AggregatorService {
    aggregator: aggregator::Aggregator,
    rules: Rules,
    router: Arc<Router>,
    flush_interval: Duration,
    next_flush: Pin<Box<Sleep>>,
}

impl AggregatorService {
    /// Creates a new aggregator service that routes its datapoints through `router`.
    pub fn new(config: AggregatorConfig, rules: Rules, router: Arc<Router>) -> Self {
        let flush_interval = config.flush_interval();

        Self {
            aggregator: aggregator::Aggregator::new(config),
            rules,
            router,
            flush_interval,
            next_flush: Box::pin(tokio::time::sleep(flush_interval)),
        }
    }

    fn handle_record_samples(&mut self, message: RecordSamples) {
        for sample in message.samples {
            let samples = self.rules.apply(sample);
            if samples.is_empty() {
                metric!(counter(ServerCounters::SamplesRejected) += 1, reason = "rule");
                continue;
            }

            for sample in samples {
                if let Err(error) = self.aggregator.record(sample) {
                    statsrelay_log::debug!(
                        error = &error as &dyn Error,
                        "aggregator rejected sample"
                    );
                    metric!(
                        counter(ServerCounters::SamplesRejected) += 1,
                        reason = "aggregate"
                    );
                }
            }
        }
    }

    /// Closes the current window and routes its datapoints.
    fn flush(&mut self) -> RouteSummary {
        let start = Instant::now();

        let datapoints = self.aggregator.flush(UnixTimestamp::now());
        let summary = self.router.route_all(datapoints);

        if summary.dropped() > 0 {
            statsrelay_log::debug!(
                datapoints = summary.datapoints,
                dropped = summary.dropped(),
                "destinations rejected datapoints of window"
            );
        }

        metric!(histogram(ServerHistograms::RoutedDatapoints) = summary.datapoints);
        metric!(timer(ServerTimers::FlushDuration) = start.elapsed());
        self.router.report_stats();

        summary
    }

    fn handle_flush_window(&mut self, sender: Sender<RouteSummary>) {
        sender.send(self.flush());
    }

    fn handle_message(&mut self, message: Aggregator) {
        match message {
            Aggregator::RecordSamples(message) => self.handle_record_samples(message),
            Aggregator::FlushWindow(_, sender) => self.handle_flush_window(sender),
            Aggregator::AcceptsMetrics(_, sender) => {
                sender.send(self.router.accepts_datapoints())
            }
            Aggregator::GetStats(_, sender) => sender.send(self.aggregator.stats()),
        }
    }

    fn handle_scheduled_flush(&mut self) {
        self.flush();

        // Keep a fixed cadence unless a flush overran the next deadline.
        let deadline = self.next_flush.deadline() + self.flush_interval;
        let now = Instant::now();
        let next = if deadline > now {
            deadline
        } else {
            now + self.flush_interval
        };
        self.next_flush.as_mut().reset(next);
    }

    fn handle_shutdown(&mut self) {
        let summary = self.flush();
        statsrelay_log::info!(
            datapoints = summary.datapoints,
            queued = summary.queued,
            "flushed final window before shutdown"
        );
        self.router.seal();
    }
}

impl Service for AggregatorService {
    type Interface = Aggregator;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let mut shutdown = Controller::shutdown_handle();

        statsrelay_log::info!(
            interval_ms = self.flush_interval.as_millis() as u64,
            rules = self.rules.len(),
            "aggregator started"
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut self.next_flush => self.handle_scheduled_flush(),
                Some(message) = rx.recv() => self.handle_message(message),
                _ = shutdown.notified() => {
                    self.handle_shutdown();
                    break;
                }

                else => break,
            }
        }

        statsrelay_log::info!("aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use statsrelay_forward::{DestinationNode, ForwardConfig, Protocol};
    use statsrelay_metrics::MetricKind;

    use super::*;

    fn router(node: &str) -> Arc<Router> {
        let config = ForwardConfig {
            destinations: vec![node.parse().unwrap()],
            protocol: Protocol::Line,
            ..Default::default()
        };
        Arc::new(Router::new(config).unwrap())
    }

    fn service(rules: &str, router: Arc<Router>) -> AggregatorService {
        let config = AggregatorConfig {
            flush_interval: 60_000,
            ..Default::default()
        };
        AggregatorService::new(config, rules.parse().unwrap(), router)
    }

    fn counter(name: &str, value: f64) -> Sample {
        Sample::new(name, value, MetricKind::Counter)
    }

    #[tokio::test]
    async fn test_flush_routes_window() {
        statsrelay_test::setup();

        let router = router("127.0.0.1:2003");
        let addr = service("", Arc::clone(&router)).start_detached();

        addr.send(RecordSamples {
            samples: vec![counter("foo", 1.0), counter("foo", 2.0), counter("bar", 1.0)],
        });

        let summary = addr.send(FlushWindow).await.unwrap();
        assert_eq!(
            summary,
            RouteSummary {
                datapoints: 2,
                queued: 2,
                ..Default::default()
            }
        );

        let node: DestinationNode = "127.0.0.1:2003".parse().unwrap();
        assert_eq!(router.connection(&node).unwrap().len(), 2);

        // The window was reset, so a second flush has nothing to report.
        let summary = addr.send(FlushWindow).await.unwrap();
        assert_eq!(summary.datapoints, 0);
    }

    #[tokio::test]
    async fn test_rules_apply_before_recording() {
        statsrelay_test::setup();

        let rules = "path_like debug.* => drop";
        let addr = service(rules, router("127.0.0.1:2003")).start_detached();

        addr.send(RecordSamples {
            samples: vec![counter("debug.requests", 1.0), counter("requests", 1.0)],
        });

        let stats = addr.send(GetStats).await.unwrap();
        assert_eq!(stats.samples_recorded, 1);
        assert_eq!(stats.tracked_metrics, 1);
    }

    #[tokio::test]
    async fn test_invalid_samples_are_counted() {
        statsrelay_test::setup();

        let addr = service("", router("127.0.0.1:2003")).start_detached();

        addr.send(RecordSamples {
            samples: vec![counter("foo", f64::NAN), counter("foo", 1.0)],
        });

        let stats = addr.send(GetStats).await.unwrap();
        assert_eq!(stats.samples_recorded, 1);
        assert_eq!(stats.samples_rejected, 1);
    }

    #[tokio::test]
    async fn test_accepts_metrics() {
        statsrelay_test::setup();

        let addr = service("", router("127.0.0.1:2003")).start_detached();
        assert_eq!(addr.send(AcceptsMetrics).await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_flush() {
        statsrelay_test::setup();

        let router = router("127.0.0.1:2003");
        let config = AggregatorConfig {
            flush_interval: 1_000,
            ..Default::default()
        };
        let addr = AggregatorService::new(config, Rules::default(), Arc::clone(&router))
            .start_detached();

        addr.send(RecordSamples {
            samples: vec![counter("foo", 1.0)],
        });
        // Round trip to make sure the samples were recorded.
        addr.send(GetStats).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        addr.send(GetStats).await.unwrap();

        let node: DestinationNode = "127.0.0.1:2003".parse().unwrap();
        assert_eq!(router.connection(&node).unwrap().len(), 1);
    }
}
