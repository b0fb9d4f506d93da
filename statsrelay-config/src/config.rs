use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use statsrelay_forward::{DestinationNode, ForwardConfig, Protocol};
use statsrelay_metrics::aggregator::AggregatorConfig;
use statsrelay_metrics::rules::Rules;

/// The file name of the configuration file inside the config folder.
const CONFIG_FILE_NAME: &str = "config.yml";

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    origin: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            origin: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            origin: ConfigErrorSource::None,
            kind,
            inner: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.origin = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.origin = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The host the statsd listener should bind to (network interface).
    pub host: Option<String>,
    /// The UDP port of the statsd listener.
    pub port: Option<String>,
    /// Comma separated list of destinations as `host:port`.
    pub destinations: Option<String>,
    /// The wire format spoken with destinations.
    pub protocol: Option<String>,
    /// The flush interval in milliseconds.
    pub flush_interval: Option<String>,
    /// The shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

/// Controls the statsd listeners.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Listener {
    /// The host the listeners bind to. Defaults to `0.0.0.0`.
    host: IpAddr,
    /// The UDP port for statsd samples. Defaults to `8125`.
    port: u16,
    /// An optional TCP port for newline delimited statsd samples.
    tcp_port: Option<u16>,
    /// A message answered with `monitor_response` instead of being parsed.
    monitor_message: String,
    /// The response to `monitor_message`.
    monitor_response: String,
    /// The maximum size of a received datagram in bytes. Defaults to `65535`.
    max_datagram_size: usize,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8125,
            tcp_port: None,
            monitor_message: "statsrelay ping".to_owned(),
            monitor_response: "statsrelay pong".to_owned(),
            max_datagram_size: 65_535,
        }
    }
}

/// Controls internal reporting to statsd.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables internal metrics.
    statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"statsrelay"`.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    hostname_tag: Option<String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "statsrelay".to_owned(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
        }
    }
}

/// Controls various limits.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    /// The maximum number of seconds to wait for pending datapoints after receiving a shutdown
    /// signal.
    shutdown_timeout: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            shutdown_timeout: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    listener: Listener,
    #[serde(default)]
    aggregator: AggregatorConfig,
    #[serde(default)]
    forwarding: ForwardConfig,
    #[serde(default)]
    logging: statsrelay_log::LogConfig,
    #[serde(default)]
    metrics: Metrics,
    #[serde(default)]
    limits: Limits,
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// A missing `config.yml` is not an error. In that case all defaults apply.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let file = path.join(CONFIG_FILE_NAME);
        let values = match fs::File::open(&file) {
            Ok(f) => serde_yaml::from_reader(io::BufReader::new(f))
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&file))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ConfigValues::default(),
            Err(e) => {
                return Err(ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&file));
            }
        };

        let config = Config { values, path };
        config.validate().map_err(|e| e.file(&file))?;
        Ok(config)
    }

    /// Creates a config from a YAML string.
    ///
    /// This is mostly useful for tests.
    pub fn from_yaml_str(yaml: &str) -> Result<Config, ConfigError> {
        let config = Config {
            values: serde_yaml::from_str(yaml)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?,
            path: PathBuf::new(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let listener = &mut self.values.listener;

        if let Some(host) = overrides.host {
            listener.host = host
                .parse::<IpAddr>()
                .map_err(|err| ConfigError::for_field(err, "host"))?;
        }

        if let Some(port) = overrides.port {
            listener.port = port
                .as_str()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "port"))?;
        }

        let forwarding = &mut self.values.forwarding;
        if let Some(destinations) = overrides.destinations {
            forwarding.destinations = destinations
                .split(',')
                .filter(|d| !d.trim().is_empty())
                .map(str::parse::<DestinationNode>)
                .collect::<Result<_, _>>()
                .map_err(|err| ConfigError::for_field(err, "destinations"))?;
        }

        if let Some(protocol) = overrides.protocol {
            forwarding.protocol = match protocol.to_lowercase().as_str() {
                "line" | "plaintext" => Protocol::Line,
                "framed" | "pickle" => Protocol::Framed,
                _ => return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("protocol")),
            };
        }

        if let Some(flush_interval) = overrides.flush_interval {
            self.values.aggregator.flush_interval = flush_interval
                .parse()
                .map_err(|err| ConfigError::for_field(err, "flush_interval"))?;
        }

        let limits = &mut self.values.limits;
        if let Some(shutdown_timeout) = overrides.shutdown_timeout {
            if let Ok(shutdown_timeout) = shutdown_timeout.parse::<u64>() {
                limits.shutdown_timeout = shutdown_timeout;
            }
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.values
            .forwarding
            .validate()
            .map_err(|err| ConfigError::for_field(err, "forwarding"))?;

        if self.values.aggregator.flush_interval == 0 {
            return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("flush_interval"));
        }

        // Percentiles must lie within (0, 100].
        let percentiles = &self.values.aggregator.timer_percentiles;
        if !percentiles.iter().all(|&p| p > 0.0 && p <= 100.0) {
            return Err(
                ConfigError::new(ConfigErrorKind::InvalidValue).field("timer_percentiles")
            );
        }

        self.rules()
            .map_err(|err| ConfigError::for_field(err, "rules"))?;

        Ok(())
    }

    /// Checks if the config file exists in the given folder.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(path.as_ref().join(CONFIG_FILE_NAME)).is_ok()
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the socket address of the UDP statsd listener.
    pub fn listen_addr(&self) -> SocketAddr {
        (self.values.listener.host, self.values.listener.port).into()
    }

    /// Returns the socket address of the TCP statsd listener, if enabled.
    pub fn tcp_listen_addr(&self) -> Option<SocketAddr> {
        let listener = &self.values.listener;
        listener.tcp_port.map(|port| (listener.host, port).into())
    }

    /// Returns the liveness probe message.
    pub fn monitor_message(&self) -> &str {
        &self.values.listener.monitor_message
    }

    /// Returns the response to the liveness probe.
    pub fn monitor_response(&self) -> &str {
        &self.values.listener.monitor_response
    }

    /// Returns the maximum size of a datagram accepted by the UDP listener.
    pub fn max_datagram_size(&self) -> usize {
        self.values.listener.max_datagram_size
    }

    /// Returns the configuration of the aggregator.
    pub fn aggregator_config(&self) -> &AggregatorConfig {
        &self.values.aggregator
    }

    /// Returns the parsed input rules.
    pub fn rules(&self) -> Result<Rules, statsrelay_metrics::rules::RuleError> {
        self.values.aggregator.rules.parse()
    }

    /// Returns the configuration of datapoint forwarding.
    pub fn forward_config(&self) -> &ForwardConfig {
        &self.values.forwarding
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &statsrelay_log::LogConfig {
        &self.values.logging
    }

    /// Returns the statsd server address for internal metrics, if configured.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Return the prefix for statsd metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the hostname tag that should be attached to each outgoing metric.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns the maximum time to wait for pending datapoints on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            path: PathBuf::new(),
        }
    }
}
