use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parameters used by the [`Aggregator`](crate::aggregator::Aggregator).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// The length of a flush window in milliseconds.
    ///
    /// Defaults to `10000`. All samples recorded within a window are reported together, with the
    /// timestamp of the end of the window.
    pub flush_interval: u64,

    /// A prefix prepended to all reported metric names.
    ///
    /// A separating `.` is added if the prefix does not end with one. Defaults to no prefix.
    pub prefix: Option<String>,

    /// The percentiles reported for timers, as `<name>.upper_<percentile>`.
    ///
    /// Defaults to `[90]`.
    pub timer_percentiles: Vec<f64>,

    /// Report metrics that did not receive samples in a window.
    ///
    /// Idle counters are reported as `0`, idle gauges repeat their last value and idle timers
    /// report a count of `0`. Defaults to `false`, which omits idle metrics.
    pub report_idle_as_zero: bool,

    /// The number of consecutive idle windows after which a metric is forgotten.
    ///
    /// Defaults to `5`.
    pub max_idle_windows: u32,

    /// Log every received line and every flushed datapoint at info level.
    pub dump_mode: bool,

    /// Input rules applied to every sample before aggregation, one per line.
    ///
    /// See [`Rules`](crate::rules::Rules) for the syntax.
    pub rules: String,
}

impl AggregatorConfig {
    /// Returns the flush interval as [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }

    /// Returns the normalized prefix including a trailing separator, or an empty string.
    pub fn name_prefix(&self) -> String {
        match self.prefix.as_deref() {
            None | Some("") => String::new(),
            Some(prefix) if prefix.ends_with('.') => prefix.to_owned(),
            Some(prefix) => format!("{prefix}."),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: 10_000,
            prefix: None,
            timer_percentiles: vec![90.0],
            report_idle_as_zero: false,
            max_idle_windows: 5,
            dump_mode: false,
            rules: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_yaml() {
        let config: AggregatorConfig = serde_yaml::from_str("prefix: stats").unwrap();
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert_eq!(config.name_prefix(), "stats.");
        assert_eq!(config.timer_percentiles, [90.0]);
        assert!(!config.report_idle_as_zero);
    }

    #[test]
    fn test_name_prefix() {
        let mut config = AggregatorConfig::default();
        assert_eq!(config.name_prefix(), "");
        config.prefix = Some("statsd.".to_owned());
        assert_eq!(config.name_prefix(), "statsd.");
    }
}
