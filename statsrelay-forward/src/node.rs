use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An error parsing a [`DestinationNode`] from a `host:port` string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseNodeError {
    /// The string has no `:port` suffix.
    #[error("destination is missing a port")]
    MissingPort,
    /// The port is not a number between 1 and 65535.
    #[error("invalid destination port")]
    InvalidPort,
    /// The host part is empty.
    #[error("destination is missing a host")]
    MissingHost,
}

/// A downstream storage node, identified by host and port.
///
/// Nodes are keys of the hash ring. Their string form `host:port` (or `[host]:port` for IPv6)
/// is used both in configuration and to place the node's virtual replicas on the ring.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DestinationNode {
    host: String,
    port: u16,
}

impl DestinationNode {
    /// Creates a new destination node.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The hostname or IP address of the node.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port of the node.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for DestinationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for DestinationNode {
    type Err = ParseNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.trim().rsplit_once(':').ok_or(ParseNodeError::MissingPort)?;

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or(ParseNodeError::InvalidPort)?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseNodeError::MissingHost);
        }

        Ok(Self::new(host, port))
    }
}

impl Serialize for DestinationNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DestinationNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = Cow::<'de, str>::deserialize(deserializer)?;
        string.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node() {
        let node: DestinationNode = "carbon-1.internal:2004".parse().unwrap();
        assert_eq!(node, DestinationNode::new("carbon-1.internal", 2004));
        assert_eq!(node.to_string(), "carbon-1.internal:2004");
    }

    #[test]
    fn test_parse_ipv6_node() {
        let node: DestinationNode = "[::1]:2003".parse().unwrap();
        assert_eq!(node.host(), "::1");
        assert_eq!(node.to_string(), "[::1]:2003");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "localhost".parse::<DestinationNode>(),
            Err(ParseNodeError::MissingPort)
        );
        assert_eq!(
            "localhost:0".parse::<DestinationNode>(),
            Err(ParseNodeError::InvalidPort)
        );
        assert_eq!(
            "localhost:http".parse::<DestinationNode>(),
            Err(ParseNodeError::InvalidPort)
        );
        assert_eq!(
            ":2004".parse::<DestinationNode>(),
            Err(ParseNodeError::MissingHost)
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let nodes: Vec<DestinationNode> =
            serde_yaml::from_str("- 10.0.0.1:2004\n- 10.0.0.2:2004\n").unwrap();
        assert_eq!(nodes[1], DestinationNode::new("10.0.0.2", 2004));
        assert_eq!(
            serde_yaml::to_string(&nodes).unwrap(),
            "- 10.0.0.1:2004\n- 10.0.0.2:2004\n"
        );
    }
}
