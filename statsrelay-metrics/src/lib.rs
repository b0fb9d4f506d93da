//! Metric samples, their statsd text protocol, and windowed aggregation.
//!
//! Clients submit [`Sample`]s in the statsd text protocol:
//!
//! ```text
//! <name>:<value>|<type>[|@<sample_rate>]
//! ```
//!
//! The [`Aggregator`](aggregator::Aggregator) accumulates samples per metric name over a flush
//! window and turns them into [`Datapoint`]s when flushed. Before aggregation, optional input
//! [`Rules`](rules::Rules) may drop, rename or retype samples.
//!
//! # Metric Types
//!
//! - **Counter** (`c`): summed over the window, scaled by the inverse sample rate.
//! - **Gauge** (`g`): the last value recorded in the window.
//! - **Timer** (`ms`): all values of the window, reported as a summary.
//!
//! # Example
//!
//! ```
//! use statsrelay_metrics::Sample;
//!
//! let data = b"endpoint.hits:1|c\nendpoint.response_time:57|ms|@0.5";
//!
//! for result in Sample::parse_all(data) {
//!     let sample = result.expect("sample should parse");
//!     println!("{} = {}", sample.name, sample.value);
//! }
//! ```
#![warn(missing_docs)]

pub mod aggregator;
mod protocol;
pub mod rules;
mod statsd;

pub use self::protocol::*;
