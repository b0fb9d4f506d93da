//! Statsrelay receives statsd samples, aggregates them and forwards the aggregated datapoints to a
//! cluster of storage nodes.
//!
//! # Usage
//!
//! ```bash
//! statsrelay run --destinations carbon-1:2004,carbon-2:2004
//! ```
//!
//! Configuration is read from `config.yml` in the config folder, which defaults to `.statsrelay`
//! and can be changed with `--config`. All values can be inspected with `statsrelay config show`.

mod cli;
mod cliapp;
mod setup;

use std::process;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            statsrelay_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
