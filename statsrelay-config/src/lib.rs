//! Configuration for the statsrelay CLI and server.
//!
//! The configuration is read from `config.yml` inside a config folder. All sections and fields are
//! optional and fall back to defaults:
//!
//! ```yaml
//! listener:
//!   port: 8125
//! aggregator:
//!   flush_interval: 10000
//! forwarding:
//!   destinations:
//!     - carbon-a:2004
//!     - carbon-b:2004
//!   protocol: framed
//! ```
//!
//! Values can be overridden from the command line or the environment through
//! [`OverridableConfig`].
#![warn(missing_docs)]

mod config;

pub use self::config::*;
