//! This module implements the definition of the command line app.

use std::path::PathBuf;

use clap::{Arg, Command, ValueHint, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Aggregates statsd metrics and forwards them to a cluster of storage nodes.";

pub fn make_app() -> Command {
    Command::new("statsrelay")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .value_hint(ValueHint::DirPath)
                .value_parser(value_parser!(PathBuf))
                .env("STATSRELAY_CONFIG")
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run statsrelay")
                .after_help(
                    "This runs statsrelay in the foreground until it's shut down. It will bind \
                     to the port and network interface configured in the config file, and \
                     forward to the configured destinations.",
                )
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("HOST")
                        .env("STATSRELAY_HOST")
                        .help("The network interface the statsd listener binds to."),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .short('p')
                        .value_name("PORT")
                        .env("STATSRELAY_PORT")
                        .help("The UDP port of the statsd listener."),
                )
                .arg(
                    Arg::new("destinations")
                        .long("destinations")
                        .short('d')
                        .value_name("HOST:PORT,...")
                        .env("STATSRELAY_DESTINATIONS")
                        .help("Comma separated list of storage nodes."),
                )
                .arg(
                    Arg::new("protocol")
                        .long("protocol")
                        .value_name("PROTOCOL")
                        .value_parser(["line", "framed", "plaintext", "pickle"])
                        .env("STATSRELAY_PROTOCOL")
                        .help("The wire format spoken with storage nodes."),
                )
                .arg(
                    Arg::new("flush_interval")
                        .long("flush-interval")
                        .value_name("MILLISECONDS")
                        .env("STATSRELAY_FLUSH_INTERVAL")
                        .help("The length of an aggregation window in milliseconds."),
                )
                .arg(
                    Arg::new("shutdown_timeout")
                        .long("shutdown-timeout")
                        .value_name("SECONDS")
                        .env("STATSRELAY_SHUTDOWN_TIMEOUT")
                        .help(
                            "Maximum number of seconds to deliver queued datapoints after \
                             receiving a shutdown signal.",
                        ),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the statsrelay config")
                .after_help(
                    "This command provides basic config management. It can be used primarily \
                     to inspect the effective configuration.",
                )
                .subcommand_required(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .arg(
                            Arg::new("format")
                                .short('f')
                                .long("format")
                                .default_value("yaml")
                                .value_parser(["debug", "yaml"])
                                .help("The output format"),
                        ),
                ),
        )
}
