use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_REPLICAS, DestinationNode, Protocol};

/// The transport used to reach destination nodes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A persistent TCP stream per node.
    #[default]
    Tcp,
    /// Connected UDP sockets.
    ///
    /// Batches are split so that every datagram stays within `max_datagram_size`.
    Udp,
}

/// What happens to a datapoint enqueued into a full send queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming datapoint and keep the queue as is.
    #[default]
    DropNewest,
    /// Evict the oldest queued datapoint to admit the incoming one.
    DropOldest,
}

/// An invalid forwarding configuration.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ForwardConfigError {
    /// There are no destinations to route to.
    #[error("at least one destination is required")]
    NoDestinations,
    /// The ring needs at least one replica per node.
    #[error("replicas must be greater than zero")]
    NoReplicas,
    /// The replication factor is zero.
    #[error("replication_factor must be greater than zero")]
    InvalidReplicationFactor,
    /// Queues or batches cannot hold a single datapoint.
    #[error("max_queue_size and max_datapoints_per_message must be greater than zero")]
    EmptyQueue,
    /// The watermarks are not ordered within the queue capacity.
    #[error("watermarks must satisfy 0 < low_watermark <= high_watermark <= max_queue_size")]
    InvalidWatermarks,
    /// The datagram size is zero or exceeds the UDP limit.
    #[error("max_datagram_size must be between 1 and 65507")]
    InvalidDatagramSize,
}

/// The largest payload of a single UDP datagram over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Forwarding of aggregated datapoints to destination nodes.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// The destination nodes as `host:port`.
    ///
    /// Defaults to `["127.0.0.1:2004"]`.
    pub destinations: Vec<DestinationNode>,

    /// The wire format spoken with all destinations. Defaults to `framed`.
    pub protocol: Protocol,

    /// The transport to the destinations. Defaults to `tcp`.
    pub transport: TransportKind,

    /// Number of virtual replicas per destination on the hash ring.
    pub replicas: usize,

    /// Number of distinct destinations receiving each datapoint. Defaults to `1`.
    pub replication_factor: usize,

    /// Capacity of each destination's send queue. Defaults to `20000`.
    pub max_queue_size: usize,

    /// The behavior of a full send queue.
    pub overflow_policy: OverflowPolicy,

    /// Queue depth at which a destination stops accepting datapoints.
    ///
    /// Defaults to `max_queue_size`.
    pub high_watermark: Option<usize>,

    /// Queue depth below which a paused destination accepts datapoints again.
    ///
    /// Defaults to 80% of `max_queue_size`.
    pub low_watermark: Option<usize>,

    /// The maximum number of datapoints written in a single payload. Defaults to `1000`.
    pub max_datapoints_per_message: usize,

    /// The maximum payload of a datagram in bytes when using the `udp` transport.
    ///
    /// Defaults to `65507`.
    pub max_datagram_size: usize,

    /// Timeout for establishing a connection in milliseconds. Defaults to `5000`.
    pub connect_timeout: u64,

    /// Timeout for writing a single payload in milliseconds. Defaults to `10000`.
    pub send_timeout: u64,

    /// First reconnect delay in milliseconds. Defaults to `1000`.
    pub reconnect_initial_interval: u64,

    /// Upper bound of the reconnect delay in milliseconds. Defaults to `5000`.
    pub reconnect_max_interval: u64,
}

impl ForwardConfig {
    /// Checks that the configuration can be used to build a router.
    pub fn validate(&self) -> Result<(), ForwardConfigError> {
        if self.destinations.is_empty() {
            return Err(ForwardConfigError::NoDestinations);
        }
        if self.replicas == 0 {
            return Err(ForwardConfigError::NoReplicas);
        }
        if self.replication_factor == 0 {
            return Err(ForwardConfigError::InvalidReplicationFactor);
        }
        if self.max_queue_size == 0 || self.max_datapoints_per_message == 0 {
            return Err(ForwardConfigError::EmptyQueue);
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(ForwardConfigError::InvalidDatagramSize);
        }

        let high = self.high_watermark();
        if self.high_watermark.is_some_and(|h| h == 0 || h > self.max_queue_size)
            || self.low_watermark.is_some_and(|l| l == 0 || l > high)
        {
            return Err(ForwardConfigError::InvalidWatermarks);
        }

        Ok(())
    }

    /// Returns the effective high watermark.
    pub fn high_watermark(&self) -> usize {
        self.high_watermark
            .unwrap_or(self.max_queue_size)
            .min(self.max_queue_size)
    }

    /// Returns the effective low watermark.
    pub fn low_watermark(&self) -> usize {
        let default = (self.max_queue_size * 4 / 5).max(1);
        self.low_watermark
            .unwrap_or(default)
            .min(self.high_watermark())
    }

    /// Returns the connect timeout as [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    /// Returns the send timeout as [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout)
    }

    /// Returns the first reconnect delay as [`Duration`].
    pub fn reconnect_initial_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_interval)
    }

    /// Returns the maximum reconnect delay as [`Duration`].
    pub fn reconnect_max_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_interval)
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            destinations: vec![DestinationNode::new("127.0.0.1", 2004)],
            protocol: Protocol::default(),
            transport: TransportKind::default(),
            replicas: DEFAULT_REPLICAS,
            replication_factor: 1,
            max_queue_size: 20_000,
            overflow_policy: OverflowPolicy::default(),
            high_watermark: None,
            low_watermark: None,
            max_datapoints_per_message: 1000,
            max_datagram_size: MAX_UDP_PAYLOAD,
            connect_timeout: 5_000,
            send_timeout: 10_000,
            reconnect_initial_interval: 1_000,
            reconnect_max_interval: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ForwardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.high_watermark(), 20_000);
        assert_eq!(config.low_watermark(), 16_000);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
destinations:
  - carbon-a:2003
  - "[::1]:2003"
protocol: line
overflow_policy: drop_oldest
max_queue_size: 10
"#;
        let config: ForwardConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());

        assert_debug_snapshot!((&config.destinations, config.protocol, config.overflow_policy), @r#"
        (
            [
                DestinationNode {
                    host: "carbon-a",
                    port: 2003,
                },
                DestinationNode {
                    host: "::1",
                    port: 2003,
                },
            ],
            Line,
            DropOldest,
        )
        "#);
        assert_eq!(config.low_watermark(), 8);
    }

    #[test]
    fn test_small_queue_watermarks() {
        let config = ForwardConfig {
            max_queue_size: 1,
            ..Default::default()
        };
        assert_eq!(config.high_watermark(), 1);
        assert_eq!(config.low_watermark(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let config = ForwardConfig {
            destinations: vec![],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ForwardConfigError::NoDestinations));

        let config = ForwardConfig {
            replication_factor: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ForwardConfigError::InvalidReplicationFactor)
        );

        let config = ForwardConfig {
            max_queue_size: 100,
            high_watermark: Some(50),
            low_watermark: Some(60),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ForwardConfigError::InvalidWatermarks));

        let config = ForwardConfig {
            max_queue_size: 100,
            high_watermark: Some(200),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ForwardConfigError::InvalidWatermarks));

        let config = ForwardConfig {
            max_datagram_size: 70_000,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ForwardConfigError::InvalidDatagramSize)
        );
    }
}
