use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::ArgMatches;
use statsrelay_config::{Config, OverridableConfig};

use crate::cliapp::make_app;
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(".statsrelay"));

    let mut config = Config::from_path(&config_path)?;

    if let Some(matches) = matches.subcommand_matches("run") {
        config.apply_override(extract_config_args(matches))?;
    }

    statsrelay_log::init(config.logging());

    if let Some(matches) = matches.subcommand_matches("config") {
        manage_config(&config, matches)
    } else if matches.subcommand_matches("run").is_some() {
        run(config)
    } else {
        bail!("missing subcommand")
    }
}

/// Extract config arguments from a parsed command line arguments object.
pub fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        host: matches.get_one("host").cloned(),
        port: matches.get_one("port").cloned(),
        destinations: matches.get_one("destinations").cloned(),
        protocol: matches.get_one("protocol").cloned(),
        flush_interval: matches.get_one("flush_interval").cloned(),
        shutdown_timeout: matches.get_one("shutdown_timeout").cloned(),
    }
}

pub fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    if let Some(matches) = matches.subcommand_matches("show") {
        show_config(config, matches)
    } else {
        bail!("unknown config subcommand")
    }
}

#[allow(clippy::print_stdout)]
fn show_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    match matches.get_one::<String>("format").map(String::as_str) {
        Some("debug") => println!("{config:#?}"),
        _ => print!("{}", config.to_yaml_string()?),
    }

    Ok(())
}

pub fn run(config: Config) -> Result<()> {
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;
    statsrelay_server::run(config)?;
    Ok(())
}
