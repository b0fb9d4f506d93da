//! Logging facade for statsrelay.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be read from the `logging` section of the config file.
//!
//! ```ignore
//! let log_config = statsrelay_log::LogConfig {
//!     enable_backtraces: true,
//!     ..statsrelay_log::LogConfig::default()
//! };
//!
//! statsrelay_log::init(&log_config);
//! ```
//!
//! # Logging
//!
//! Use the five macros [`error!`], [`warn!`], [`info!`], [`debug!`] and [`trace!`]. They accept
//! format strings like [`println!`] as well as structured fields.
//!
//! ## Conventions
//!
//! Log messages start lowercase and end without punctuation. Prefer short and precise messages.
//!
//! - [`error!`] for bugs and invalid behavior.
//! - [`warn!`] for undesirable behavior, such as a destination that went away.
//! - [`info!`] for messages relevant to operators.
//! - [`debug!`] for messages usually relevant to debugging.
//! - [`trace!`] for full auxiliary information.
//!
//! ## Logging Error Types
//!
//! Pass errors as a structured field so that all sources are preserved:
//!
//! ```
//! let error = std::io::Error::other("oh no!");
//! statsrelay_log::error!(error = &error as &dyn std::error::Error, "operation failed");
//! ```
//!
//! When a plain message is needed, wrap the error in [`LogError`], which prints the full chain of
//! causes.
//!
//! # Testing
//!
//! Tests can capture logs by calling [`init_test!`] at the start of the test.

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

pub use tracing::{debug, error, info, trace, warn};
