//! Services of the statsrelay server.
//!
//! The listeners parse incoming statsd lines and send them to the aggregator. The aggregator
//! closes a window on every flush interval and hands the resulting datapoints to the router of
//! `statsrelay-forward`, which runs one delivery task per destination.

pub mod aggregator;
pub mod listener;
