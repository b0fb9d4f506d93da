//! The statsrelay server.
//!
//! Statsrelay receives statsd samples over UDP and optionally TCP, aggregates them into fixed
//! windows and forwards the resulting datapoints to a cluster of storage nodes. Every metric name
//! is owned by one node of a consistent hash ring, so all datapoints of a metric end up on the
//! same node.
//!
//! ```text
//!  statsd clients                                           storage nodes
//!  ┌──────────┐    ┌──────────┐    ┌────────────┐    ┌────────┐    ┌────────┐
//!  │ udp/tcp  │───▶│ listener │───▶│ aggregator │───▶│ router │───▶│ node A │
//!  └──────────┘    └──────────┘    └────────────┘    └────────┘    └────────┘
//!                                    every flush          │        ┌────────┐
//!                                    interval             └───────▶│ node B │
//!                                                                  └────────┘
//! ```
//!
//! # Shutdown
//!
//! On `SIGTERM`, the listeners stop receiving and the aggregator flushes its current window a
//! final time. Destination connections then try to deliver their queues within the configured
//! shutdown timeout. `SIGINT` discards all queued datapoints.
#![warn(missing_docs)]

mod service;
mod services;
mod statsd;

use std::sync::Arc;

use anyhow::{Context, Result};
use statsrelay_config::Config;
use statsrelay_system::Controller;

pub use self::service::*;
pub use self::services::aggregator::{
    AcceptsMetrics, Aggregator, AggregatorService, FlushWindow, GetStats, RecordSamples,
};
pub use self::services::listener::ListenerSettings;

/// Runs the server until it is shut down by a signal.
///
/// This creates a multi-threaded tokio runtime, starts all services and blocks until all of them
/// stopped.
pub fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("statsrelay")
        .enable_all()
        .build()
        .context("could not create runtime")?;

    runtime.block_on(async move {
        Controller::start_signal_handler(config.shutdown_timeout());
        let state = ServiceState::start(config).await?;
        state.join().await;
        Ok::<_, anyhow::Error>(())
    })?;

    statsrelay_log::info!("statsrelay shutdown complete");
    Ok(())
}
