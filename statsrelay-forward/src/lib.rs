//! Routing and delivery of aggregated datapoints to downstream storage nodes.
//!
//! The [`Router`] maps every metric name onto a [`HashRing`] of [`DestinationNode`]s and hands the
//! datapoints to the [`Connection`] of the owning node. Each connection buffers datapoints in a
//! bounded queue and delivers them in batches over a persistent transport, encoded by the
//! configured [`WireFormat`].
//!
//! ```text
//!                       ┌──────────────┐     ┌────────────┐
//!                   ┌──▶│ Connection A │────▶│ carbon A   │
//! ┌────────┐        │   └──────────────┘     └────────────┘
//! │ Router │────────┤
//! └────────┘        │   ┌──────────────┐     ┌────────────┐
//!                   └──▶│ Connection B │────▶│ carbon B   │
//!                       └──────────────┘     └────────────┘
//! ```
#![warn(missing_docs)]

mod config;
mod connection;
mod format;
mod node;
mod ring;
mod router;
mod statsd;

pub use self::config::*;
pub use self::connection::*;
pub use self::format::*;
pub use self::node::*;
pub use self::ring::*;
pub use self::router::*;
