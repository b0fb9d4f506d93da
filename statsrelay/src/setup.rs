use anyhow::Result;
use statsrelay_config::Config;
use statsrelay_statsd::MetricsClientConfig;

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        statsrelay_log::info!("launching statsrelay without config folder");
    } else {
        statsrelay_log::info!(
            "launching statsrelay from config folder {}",
            config.path().display()
        );
    }

    let forwarding = config.forward_config();
    statsrelay_log::info!("  statsd listener: {}", config.listen_addr());
    if let Some(addr) = config.tcp_listen_addr() {
        statsrelay_log::info!("  tcp listener: {addr}");
    }
    statsrelay_log::info!("  protocol: {:?}", forwarding.protocol);
    for destination in &forwarding.destinations {
        statsrelay_log::info!("  destination: {destination}");
    }
    statsrelay_log::info!(
        "  flush interval: {}ms",
        config.aggregator_config().flush_interval
    );
    statsrelay_log::info!("  log level: {:?}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }

    statsrelay_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host,
        default_tags,
    })?;

    Ok(())
}
