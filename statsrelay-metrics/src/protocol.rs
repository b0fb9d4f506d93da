use std::fmt;
use std::iter::FusedIterator;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A unix timestamp (full seconds elapsed since 1970-01-01 00:00 UTC).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    /// Creates a unix timestamp from the given number of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Creates a unix timestamp from the given system time.
    pub fn from_system(time: SystemTime) -> Self {
        let duration = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self(duration)
    }

    /// Returns the current timestamp.
    #[inline]
    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    /// Returns the number of seconds since the UNIX epoch start.
    pub const fn as_secs(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnixTimestamp({})", self.as_secs())
    }
}

impl fmt::Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_secs().fmt(f)
    }
}

/// The aggregation behavior of a metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Counts instances of an event.
    ///
    /// Values are summed over the window, each scaled by the inverse of its sample rate.
    Counter,
    /// Stores an absolute snapshot of a value. The last value of a window wins.
    Gauge,
    /// Records durations or other measurements, reported as a summary of all values.
    Timer,
}

impl MetricKind {
    /// Returns the statsd shortcode for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Timer => "ms",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = ParseSampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "c" | "m" => Self::Counter,
            "g" => Self::Gauge,
            "ms" | "h" | "d" => Self::Timer,
            _ => return Err(ParseSampleError::InvalidKind),
        })
    }
}

/// An error returned by [`Sample::parse`] and [`Sample::parse_all`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseSampleError {
    /// The line is not valid UTF-8.
    #[error("sample is not valid utf-8")]
    InvalidUtf8,
    /// The `:` between name and value or the `|` before the type is missing.
    #[error("sample is missing a value or type")]
    MissingValue,
    /// The name is empty or contains whitespace or control characters.
    #[error("invalid metric name")]
    InvalidName,
    /// The value is not a finite number.
    #[error("invalid metric value")]
    InvalidValue,
    /// The type shortcode is unknown.
    #[error("unknown metric type")]
    InvalidKind,
    /// The sample rate is not within `(0, 1]`.
    #[error("invalid sample rate")]
    InvalidSampleRate,
}

/// Returns `true` if the name can be aggregated and forwarded.
///
/// Names must not be empty and must not contain whitespace or control characters, since the
/// line format delimits fields and datapoints with them. The statsd delimiters `:` and `|` are
/// allowed: the parser never yields them, but rules may rewrite names to contain them.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// A single metric observation submitted by a client.
///
/// Samples are consumed once by the aggregator and never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The metric name, used as the aggregation and routing key.
    pub name: String,
    /// The observed value.
    pub value: f64,
    /// How the value is aggregated.
    pub kind: MetricKind,
    /// The client-side sampling rate in `(0, 1]`.
    pub sample_rate: f64,
}

impl Sample {
    /// Creates a sample that was not subsampled by the client.
    pub fn new(name: impl Into<String>, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            sample_rate: 1.0,
        }
    }

    /// Sets the client-side sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    fn parse_str(string: &str) -> Result<Self, ParseSampleError> {
        let mut components = string.split('|');

        let (name, value) = components
            .next()
            .and_then(|s| s.split_once(':'))
            .ok_or(ParseSampleError::MissingValue)?;

        if !is_valid_name(name) {
            return Err(ParseSampleError::InvalidName);
        }

        let value = value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or(ParseSampleError::InvalidValue)?;

        let kind = components
            .next()
            .ok_or(ParseSampleError::MissingValue)?
            .trim()
            .parse()?;

        let mut sample = Sample::new(name, value, kind);

        for component in components {
            if let Some(rate) = component.strip_prefix('@') {
                sample.sample_rate = rate
                    .parse::<f64>()
                    .ok()
                    .filter(|r| *r > 0.0 && *r <= 1.0)
                    .ok_or(ParseSampleError::InvalidSampleRate)?;
            }
        }

        Ok(sample)
    }

    /// Parses a single sample from the statsd text protocol.
    ///
    /// # Example
    ///
    /// ```
    /// use statsrelay_metrics::{MetricKind, Sample};
    ///
    /// let sample = Sample::parse(b"gorets:1|c|@0.1").expect("sample should parse");
    /// assert_eq!(sample.kind, MetricKind::Counter);
    /// assert_eq!(sample.sample_rate, 0.1);
    /// ```
    pub fn parse(slice: &[u8]) -> Result<Self, ParseSampleError> {
        let string = std::str::from_utf8(slice).map_err(|_| ParseSampleError::InvalidUtf8)?;
        Self::parse_str(string.trim_end_matches(['\r', '\n']))
    }

    /// Parses all samples of a datagram or stream chunk.
    ///
    /// Returns a result for each line in `slice`, ignoring empty lines. Both UNIX newlines (`\n`)
    /// and Windows newlines (`\r\n`) are supported. It is possible to continue consuming the
    /// iterator after an `Err` is yielded.
    pub fn parse_all(slice: &[u8]) -> ParseSamples<'_> {
        ParseSamples { slice }
    }
}

/// Iterator over parsed samples returned from [`Sample::parse_all`].
#[derive(Clone, Debug, Default)]
pub struct ParseSamples<'a> {
    slice: &'a [u8],
}

impl Iterator for ParseSamples<'_> {
    type Item = Result<Sample, ParseSampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let string = match std::str::from_utf8(current) {
                Ok(string) => string.strip_suffix('\r').unwrap_or(string),
                Err(_) => return Some(Err(ParseSampleError::InvalidUtf8)),
            };

            if !string.is_empty() {
                return Some(Sample::parse_str(string));
            }
        }
    }
}

impl FusedIterator for ParseSamples<'_> {}

/// An aggregated `(name, value, timestamp)` triple ready to be forwarded.
///
/// Datapoints are created by a flush and immutable afterwards. Whoever holds the datapoint, such
/// as a destination queue, owns it until it is delivered or dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct Datapoint {
    /// The metric name including the configured prefix.
    pub name: String,
    /// The aggregated value.
    pub value: f64,
    /// The end of the flush window this datapoint belongs to.
    pub timestamp: UnixTimestamp,
}

impl Datapoint {
    /// Creates a new datapoint.
    pub fn new(name: impl Into<String>, value: f64, timestamp: UnixTimestamp) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }
}

impl fmt::Display for Datapoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.value, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_counter() {
        let sample = Sample::parse(b"foo:1|c").unwrap();
        assert_eq!(sample, Sample::new("foo", 1.0, MetricKind::Counter));
    }

    #[test]
    fn test_parse_sample_rate() {
        let sample = Sample::parse(b"foo.bar:3|c|@0.5").unwrap();
        insta::assert_debug_snapshot!(sample, @r###"
        Sample {
            name: "foo.bar",
            value: 3.0,
            kind: Counter,
            sample_rate: 0.5,
        }
        "###);
    }

    #[test]
    fn test_parse_kinds() {
        let kinds: Vec<_> = ["a:1|c", "a:1|m", "a:1|g", "a:1|ms", "a:1|h", "a:1|d"]
            .iter()
            .map(|s| Sample::parse(s.as_bytes()).unwrap().kind)
            .collect();

        assert_eq!(
            kinds,
            [
                MetricKind::Counter,
                MetricKind::Counter,
                MetricKind::Gauge,
                MetricKind::Timer,
                MetricKind::Timer,
                MetricKind::Timer,
            ]
        );
    }

    #[test]
    fn test_parse_negative_gauge() {
        let sample = Sample::parse(b"temperature:-3.5|g").unwrap();
        assert_eq!(sample.value, -3.5);
        assert_eq!(sample.kind, MetricKind::Gauge);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Sample::parse(b"foo|c"), Err(ParseSampleError::MissingValue));
        assert_eq!(Sample::parse(b"foo:1"), Err(ParseSampleError::MissingValue));
        assert_eq!(Sample::parse(b":1|c"), Err(ParseSampleError::InvalidName));
        assert_eq!(Sample::parse(b"f oo:1|c"), Err(ParseSampleError::InvalidName));
        assert_eq!(Sample::parse(b"a|b:1|c"), Err(ParseSampleError::MissingValue));
        assert_eq!(Sample::parse(b"foo:x|c"), Err(ParseSampleError::InvalidValue));
        assert_eq!(Sample::parse(b"foo:NaN|c"), Err(ParseSampleError::InvalidValue));
        assert_eq!(Sample::parse(b"foo:inf|g"), Err(ParseSampleError::InvalidValue));
        assert_eq!(Sample::parse(b"foo:1|x"), Err(ParseSampleError::InvalidKind));
        assert_eq!(
            Sample::parse(b"foo:1|c|@0"),
            Err(ParseSampleError::InvalidSampleRate)
        );
        assert_eq!(
            Sample::parse(b"foo:1|c|@1.5"),
            Err(ParseSampleError::InvalidSampleRate)
        );
        assert_eq!(
            Sample::parse(&[0x66, 0xff, 0x3a]),
            Err(ParseSampleError::InvalidUtf8)
        );
    }

    #[test]
    fn test_parse_all() {
        let data = b"foo:1|c\r\n\nbar:2|g\nbroken\nbaz:3|ms\n";
        let results: Vec<_> = Sample::parse_all(data).collect();

        assert_eq!(
            results,
            vec![
                Ok(Sample::new("foo", 1.0, MetricKind::Counter)),
                Ok(Sample::new("bar", 2.0, MetricKind::Gauge)),
                Err(ParseSampleError::MissingValue),
                Ok(Sample::new("baz", 3.0, MetricKind::Timer)),
            ]
        );
    }

    #[test]
    fn test_datapoint_display() {
        let datapoint = Datapoint::new("foo", 5.0, UnixTimestamp::from_secs(1700000000));
        assert_eq!(datapoint.to_string(), "foo 5 1700000000");
    }
}
