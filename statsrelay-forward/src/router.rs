use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use statsrelay_metrics::Datapoint;
use statsrelay_statsd::metric;
use statsrelay_system::Controller;
use tokio::task::JoinHandle;

use crate::statsd::{ForwardCounters, ForwardGauges};
use crate::{
    Admission, Connection, ConnectionStats, DestinationNode, ForwardConfig, ForwardConfigError,
    HashRing, WireFormat,
};

/// An error creating or rebuilding a [`Router`].
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The router was given an empty node list.
    #[error("cannot route without destinations")]
    NoDestinations,
    /// The forwarding configuration is invalid.
    #[error("invalid forwarding configuration")]
    InvalidConfig(#[from] ForwardConfigError),
}

/// The result of [`Router::route_all`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RouteSummary {
    /// Number of datapoints passed to the router.
    pub datapoints: usize,
    /// Number of copies admitted to destination queues.
    pub queued: usize,
    /// Number of copies dropped because a queue was full.
    pub dropped_queue_full: usize,
    /// Number of copies rejected by a paused destination.
    pub dropped_backpressure: usize,
    /// Number of copies rejected by a connection closed during a concurrent rebuild.
    pub dropped_discarded: usize,
}

impl RouteSummary {
    /// The total number of dropped copies.
    pub fn dropped(&self) -> usize {
        self.dropped_queue_full + self.dropped_backpressure + self.dropped_discarded
    }
}

/// A ring together with one connection per ring node, in the same order.
#[derive(Debug)]
struct Topology {
    ring: HashRing,
    connections: Vec<Connection>,
}

/// Routes datapoints to destination connections by consistent hashing of their names.
///
/// The ring and its connections are swapped atomically on [`rebuild`](Self::rebuild). Readers
/// always observe either the old or the new topology, never a mix of both. Connections of nodes
/// that survive a rebuild are kept together with their queues.
#[derive(Debug)]
pub struct Router {
    config: Arc<ForwardConfig>,
    format: Arc<dyn WireFormat>,
    topology: ArcSwap<Topology>,
    rebuild_lock: Mutex<()>,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Creates a router for the configured destinations.
    ///
    /// Connection workers are not running until [`start`](Self::start) is called.
    pub fn new(config: ForwardConfig) -> Result<Self, RouterError> {
        config.validate()?;

        let format = config.protocol.wire_format();
        let config = Arc::new(config);
        let ring = HashRing::new(config.destinations.iter().cloned(), config.replicas)
            .ok_or(RouterError::NoDestinations)?;

        let connections = ring
            .nodes()
            .iter()
            .map(|node| Connection::new(node.clone(), config.clone(), format.clone()))
            .collect();

        statsrelay_log::info!(
            destinations = ring.nodes().len(),
            format = format.name(),
            "created router"
        );

        Ok(Self {
            config,
            format,
            topology: ArcSwap::from_pointee(Topology { ring, connections }),
            rebuild_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Starts the workers of all connections.
    ///
    /// Connections added by later rebuilds are started right away. Workers stop on shutdown.
    pub fn start(&self) {
        let _guard = self.rebuild_lock.lock();
        if self.started.swap(true, Ordering::Relaxed) {
            return;
        }

        let mut workers = self.workers.lock();
        for connection in &self.topology.load().connections {
            workers.push(connection.start(Controller::shutdown_handle()));
        }
    }

    /// Seals all connections after the last datapoints have been routed during shutdown.
    ///
    /// See [`Connection::seal`].
    pub fn seal(&self) {
        for connection in &self.topology.load().connections {
            connection.seal();
        }
    }

    /// Waits for all connection workers to stop.
    ///
    /// Workers stop on shutdown, after draining their queues up to the shutdown timeout.
    pub async fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(error) = worker.await {
                statsrelay_log::error!(
                    error = &error as &dyn std::error::Error,
                    "connection worker failed"
                );
            }
        }
    }

    /// Returns the node owning `name`.
    pub fn route(&self, name: &str) -> DestinationNode {
        self.topology.load().ring.get_node(name).clone()
    }

    /// Returns the `replication_factor` distinct nodes receiving datapoints for `name`.
    pub fn route_nodes(&self, name: &str) -> Vec<DestinationNode> {
        self.topology
            .load()
            .ring
            .get_nodes(name, self.config.replication_factor)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Enqueues every datapoint at the connections of its owning nodes.
    ///
    /// Datapoints are grouped per destination first so that every queue is locked once. The order
    /// of datapoints for the same destination is preserved.
    pub fn route_all(&self, datapoints: Vec<Datapoint>) -> RouteSummary {
        let topology = self.topology.load();
        let replication = self.config.replication_factor;

        let mut summary = RouteSummary {
            datapoints: datapoints.len(),
            ..Default::default()
        };

        let mut groups = vec![Vec::new(); topology.connections.len()];
        for datapoint in datapoints {
            let indices: SmallVec<[usize; 2]> = topology
                .ring
                .node_indices(&datapoint.name, replication)
                .into_iter()
                .collect();

            if let Some((&last, rest)) = indices.split_last() {
                for &index in rest {
                    groups[index].push(datapoint.clone());
                }
                groups[last].push(datapoint);
            }
        }

        for (connection, group) in topology.connections.iter().zip(groups) {
            if group.is_empty() {
                continue;
            }

            let enqueued = connection.enqueue_all(group);
            summary.queued += enqueued.queued;
            summary.dropped_queue_full += enqueued.queue_full;
            summary.dropped_backpressure += enqueued.backpressure;
            summary.dropped_discarded += enqueued.discarded;

            // Drops are reported by the connection itself.
            let destination = connection.node().to_string();
            metric!(
                counter(ForwardCounters::DatapointsQueued) += enqueued.queued,
                destination = destination.as_str(),
            );

            if enqueued.dropped() > 0 {
                statsrelay_log::debug!(
                    destination = %destination,
                    dropped = enqueued.dropped(),
                    "destination queue rejected datapoints"
                );
            }
        }

        summary
    }

    /// Replaces the set of destination nodes.
    ///
    /// Connections of nodes present in both sets are kept. Connections of new nodes are created,
    /// and started if the router is running. Connections of removed nodes are closed and their
    /// queues discarded.
    pub fn rebuild(
        &self,
        destinations: impl IntoIterator<Item = DestinationNode>,
    ) -> Result<(), RouterError> {
        let _guard = self.rebuild_lock.lock();

        let ring = HashRing::new(destinations, self.config.replicas)
            .ok_or(RouterError::NoDestinations)?;

        let current = self.topology.load_full();
        let started = self.started.load(Ordering::Relaxed);

        let connections: Vec<_> = ring
            .nodes()
            .iter()
            .map(|node| {
                let existing = current.connections.iter().find(|c| c.node() == node);
                match existing {
                    Some(connection) => connection.clone(),
                    None => {
                        let connection =
                            Connection::new(node.clone(), self.config.clone(), self.format.clone());
                        if started {
                            let worker = connection.start(Controller::shutdown_handle());
                            self.workers.lock().push(worker);
                        }
                        connection
                    }
                }
            })
            .collect();

        let removed: Vec<_> = current
            .connections
            .iter()
            .filter(|c| !ring.nodes().contains(c.node()))
            .cloned()
            .collect();

        statsrelay_log::info!(
            destinations = ring.nodes().len(),
            removed = removed.len(),
            "rebuilt routing ring"
        );

        self.topology.store(Arc::new(Topology { ring, connections }));
        metric!(counter(ForwardCounters::RingRebuilt) += 1);

        for connection in removed {
            connection.close();
        }

        Ok(())
    }

    /// Returns `false` if every destination is paused by backpressure.
    pub fn accepts_datapoints(&self) -> bool {
        self.topology
            .load()
            .connections
            .iter()
            .any(|c| c.check_queue() == Admission::Open)
    }

    /// Returns the current destination nodes.
    pub fn destinations(&self) -> Vec<DestinationNode> {
        self.topology.load().ring.nodes().to_vec()
    }

    /// Returns the connection of `node`, if it is part of the ring.
    pub fn connection(&self, node: &DestinationNode) -> Option<Connection> {
        self.topology
            .load()
            .connections
            .iter()
            .find(|c| c.node() == node)
            .cloned()
    }

    /// Returns all connections in ring node order.
    pub fn connections(&self) -> Vec<Connection> {
        self.topology.load().connections.clone()
    }

    /// Returns the counters of every connection.
    pub fn stats(&self) -> Vec<(DestinationNode, ConnectionStats)> {
        self.topology
            .load()
            .connections
            .iter()
            .map(|c| (c.node().clone(), c.stats()))
            .collect()
    }

    /// Reports the queue depth of every destination to statsd.
    pub fn report_stats(&self) {
        for connection in &self.topology.load().connections {
            let destination = connection.node().to_string();
            metric!(
                gauge(ForwardGauges::QueueDepth) = connection.len(),
                destination = destination.as_str(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use statsrelay_metrics::UnixTimestamp;
    use statsrelay_test::MockNode;

    use super::*;
    use crate::{ConnectionState, LineFormat, Protocol};

    const T: UnixTimestamp = UnixTimestamp::from_secs(1700000000);

    fn node(name: &str) -> DestinationNode {
        DestinationNode::new(name, 2004)
    }

    fn router(config: ForwardConfig) -> Router {
        Router::new(ForwardConfig {
            destinations: vec![node("a"), node("b")],
            ..config
        })
        .unwrap()
    }

    #[test]
    fn test_no_destinations() {
        let result = Router::new(ForwardConfig {
            destinations: vec![],
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(RouterError::InvalidConfig(ForwardConfigError::NoDestinations))
        ));

        let router = router(ForwardConfig::default());
        assert!(matches!(
            router.rebuild(Vec::new()),
            Err(RouterError::NoDestinations)
        ));
        assert_eq!(router.destinations().len(), 2);
    }

    #[test]
    fn test_route_is_stable() {
        let router = router(ForwardConfig::default());
        let ring = HashRing::new([node("a"), node("b")], router.config.replicas).unwrap();

        for name in ["foo", "bar.baz", "servers.web1.cpu", ""] {
            let selected = router.route(name);
            assert_eq!(router.route(name), selected);
            assert_eq!(&selected, ring.get_node(name));
        }
    }

    #[test]
    fn test_route_all_groups_by_node() {
        let router = router(ForwardConfig::default());
        let names = ["m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8"];
        let datapoints = names.iter().map(|n| Datapoint::new(*n, 1.0, T)).collect();

        let summary = router.route_all(datapoints);
        assert_eq!(summary.datapoints, 8);
        assert_eq!(summary.queued, 8);
        assert_eq!(summary.dropped(), 0);

        for name in names {
            let connection = router.connection(&router.route(name)).unwrap();
            assert!(connection.stats().queued > 0);
        }

        let total: usize = router.connections().iter().map(|c| c.len()).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn test_replication_factor() {
        let router = router(ForwardConfig {
            replication_factor: 2,
            ..Default::default()
        });

        assert_eq!(router.route_nodes("foo").len(), 2);

        let summary = router.route_all(vec![Datapoint::new("foo", 1.0, T)]);
        assert_eq!(summary.queued, 2);
        for connection in router.connections() {
            assert_eq!(connection.len(), 1);
        }
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let router = router(ForwardConfig {
            max_queue_size: 2,
            ..Default::default()
        });

        let datapoints = (0..3).map(|i| Datapoint::new("foo", i as f64, T)).collect();
        let summary = router.route_all(datapoints);
        assert_eq!(summary.queued, 2);
        assert_eq!(summary.dropped_queue_full, 1);

        let connection = router.connection(&router.route("foo")).unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.len(), 2);
        assert_eq!(connection.stats().dropped_queue_full, 1);
    }

    #[test]
    fn test_drop_is_reported_once() {
        let router = router(ForwardConfig {
            max_queue_size: 2,
            ..Default::default()
        });

        let captures = statsrelay_statsd::with_capturing_test_client(|| {
            let datapoints = (0..3).map(|i| Datapoint::new("foo", i as f64, T)).collect();
            router.route_all(datapoints);
        });

        let dropped: Vec<_> = captures
            .iter()
            .filter(|c| c.starts_with("forward.datapoints.dropped"))
            .collect();
        let expected = format!(
            "forward.datapoints.dropped:1|c|#destination:{},reason:queue_full",
            router.route("foo")
        );
        assert_eq!(dropped, [&expected]);
    }

    #[test]
    fn test_route_into_removed_connection() {
        let router = router(ForwardConfig::default());
        let b = router.connection(&node("b")).unwrap();

        router.rebuild([node("a")]).unwrap();

        // A flush that loaded the old topology still holds the removed connection.
        let summary = b.enqueue_all([Datapoint::new("foo", 1.0, T)]);
        assert_eq!(summary.discarded, 1);
        assert!(b.is_empty());
        assert_eq!(b.stats().dropped_discarded, 1);
    }

    #[test]
    fn test_accepts_datapoints() {
        let router = Router::new(ForwardConfig {
            destinations: vec![node("a")],
            max_queue_size: 2,
            ..Default::default()
        })
        .unwrap();

        assert!(router.accepts_datapoints());
        router.route_all(vec![Datapoint::new("x", 1.0, T), Datapoint::new("y", 1.0, T)]);
        assert!(!router.accepts_datapoints());
    }

    #[test]
    fn test_rebuild_keeps_surviving_connections() {
        let router = router(ForwardConfig::default());
        router.route_all(
            (0..20)
                .map(|i| Datapoint::new(format!("m{i}"), 1.0, T))
                .collect(),
        );

        let a = router.connection(&node("a")).unwrap();
        let b = router.connection(&node("b")).unwrap();
        let queued_a = a.len();

        router.rebuild([node("a"), node("c")]).unwrap();

        assert_eq!(router.destinations(), [node("a"), node("c")]);
        assert_eq!(router.connection(&node("a")).unwrap().len(), queued_a);
        assert!(router.connection(&node("b")).is_none());
        assert!(b.is_closed());
        assert!(!a.is_closed());
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        statsrelay_test::setup();
        let first = MockNode::start().await;
        let second = MockNode::start().await;

        let router = Router::new(ForwardConfig {
            destinations: vec![
                first.destination().parse().unwrap(),
                second.destination().parse().unwrap(),
            ],
            protocol: Protocol::Line,
            ..Default::default()
        })
        .unwrap();
        router.start();

        let datapoints: Vec<_> = (0..50)
            .map(|i| Datapoint::new(format!("metric.{i}"), i as f64, T))
            .collect();
        let expected = LineFormat.serialize(&datapoints).payload.len();
        router.route_all(datapoints.clone());

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let total = first.received().len() + second.received().len();
                if total >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(received.is_ok());

        let mut delivered = LineFormat.parse(&first.received()).unwrap();
        for datapoint in &delivered {
            assert_eq!(router.route(&datapoint.name).port(), first.port());
        }
        delivered.extend(LineFormat.parse(&second.received()).unwrap());
        delivered.sort_by(|a, b| a.value.total_cmp(&b.value));
        assert_eq!(delivered, datapoints);

        for connection in router.connections() {
            connection.close();
        }
    }
}
