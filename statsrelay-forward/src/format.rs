use std::fmt;
use std::io::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use statsrelay_metrics::{Datapoint, UnixTimestamp};

/// Reasons a datapoint cannot be represented in a wire format.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The value is NaN or infinite.
    #[error("value of {0} is not finite")]
    NonFiniteValue(String),
    /// The name contains characters the format uses as delimiters, or is empty.
    #[error("metric name {0:?} cannot be encoded")]
    InvalidName(String),
    /// The encoded batch does not fit into a single frame.
    #[error("frame exceeds the maximum frame size")]
    FrameTooLarge,
    /// Writing into the output buffer failed.
    #[error("failed to write payload")]
    Io(#[from] std::io::Error),
    /// Serializing the frame body failed.
    #[error("failed to encode frame body")]
    Framed(#[from] rmp_serde::encode::Error),
}

/// An error parsing a payload produced by a [`WireFormat`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload ends in the middle of a frame.
    #[error("payload is truncated")]
    Truncated,
    /// A line does not consist of name, value and timestamp.
    #[error("malformed line {0}")]
    InvalidLine(usize),
    /// A frame body is not a valid list of datapoints.
    #[error("malformed frame body")]
    InvalidFrame(#[from] rmp_serde::decode::Error),
}

/// The result of [`WireFormat::serialize`].
#[derive(Debug, Default)]
pub struct Encoded {
    /// Bytes to write to the transport in one operation.
    pub payload: Vec<u8>,
    /// The number of datapoints contained in the payload.
    pub encoded: usize,
    /// The number of datapoints that could not be represented and were skipped.
    pub rejected: usize,
}

/// A serialization strategy for batches of datapoints.
///
/// Implementations are stateless: the same batch always yields the same bytes. A single
/// instance is shared by all connections.
pub trait WireFormat: fmt::Debug + Send + Sync {
    /// Short name of the format for logs.
    fn name(&self) -> &'static str;

    /// Checks whether a datapoint can be represented in this format.
    fn check(&self, datapoint: &Datapoint) -> Result<(), EncodeError>;

    /// Appends the encoding of already checked datapoints to `out`.
    fn encode(&self, batch: &[&Datapoint], out: &mut Vec<u8>) -> Result<(), EncodeError>;

    /// Parses a payload back into datapoints, as a downstream node would.
    fn parse(&self, payload: &[u8]) -> Result<Vec<Datapoint>, DecodeError>;

    /// Serializes a batch, skipping and counting datapoints that cannot be represented.
    ///
    /// A single bad datapoint never fails the rest of the batch.
    fn serialize(&self, batch: &[Datapoint]) -> Encoded {
        let mut rejected = 0;
        let valid: Vec<&Datapoint> = batch
            .iter()
            .filter(|datapoint| match self.check(datapoint) {
                Ok(()) => true,
                Err(error) => {
                    statsrelay_log::debug!(
                        error = &error as &dyn std::error::Error,
                        format = self.name(),
                        "dropping unserializable datapoint"
                    );
                    rejected += 1;
                    false
                }
            })
            .collect();

        let mut payload = Vec::new();
        if valid.is_empty() {
            return Encoded {
                payload,
                encoded: 0,
                rejected,
            };
        }

        match self.encode(&valid, &mut payload) {
            Ok(()) => Encoded {
                payload,
                encoded: valid.len(),
                rejected,
            },
            Err(error) => {
                statsrelay_log::error!(
                    error = &error as &dyn std::error::Error,
                    format = self.name(),
                    "failed to encode batch"
                );
                Encoded {
                    payload: Vec::new(),
                    encoded: 0,
                    rejected: batch.len(),
                }
            }
        }
    }
}

fn check_value(datapoint: &Datapoint) -> Result<(), EncodeError> {
    if datapoint.value.is_finite() {
        Ok(())
    } else {
        Err(EncodeError::NonFiniteValue(datapoint.name.clone()))
    }
}

/// The plaintext line protocol.
///
/// Every datapoint is written as `<name> <value> <timestamp>\n`:
///
/// ```text
/// servers.web1.requests 5 1700000000
/// ```
///
/// Values use the shortest representation that parses back to the same number.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineFormat;

impl WireFormat for LineFormat {
    fn name(&self) -> &'static str {
        "line"
    }

    fn check(&self, datapoint: &Datapoint) -> Result<(), EncodeError> {
        if !statsrelay_metrics::is_valid_name(&datapoint.name) {
            return Err(EncodeError::InvalidName(datapoint.name.clone()));
        }
        check_value(datapoint)
    }

    fn encode(&self, batch: &[&Datapoint], out: &mut Vec<u8>) -> Result<(), EncodeError> {
        for datapoint in batch {
            writeln!(
                out,
                "{} {} {}",
                datapoint.name, datapoint.value, datapoint.timestamp
            )?;
        }
        Ok(())
    }

    fn parse(&self, payload: &[u8]) -> Result<Vec<Datapoint>, DecodeError> {
        let mut datapoints = Vec::new();

        for (index, line) in payload.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }

            let parse_line = || {
                let line = std::str::from_utf8(line).ok()?;
                let mut parts = line.split(' ');
                let name = parts.next()?;
                let value = parts.next()?.parse().ok()?;
                let timestamp = parts.next()?.parse().ok()?;
                match parts.next() {
                    Some(_) => None,
                    None => Some(Datapoint::new(
                        name,
                        value,
                        UnixTimestamp::from_secs(timestamp),
                    )),
                }
            };

            datapoints.push(parse_line().ok_or(DecodeError::InvalidLine(index + 1))?);
        }

        Ok(datapoints)
    }
}

/// A length-prefixed binary protocol, framed like the carbon pickle protocol.
///
/// Each frame consists of a 4-byte big-endian body length followed by the body, a MessagePack
/// array of `[name, [timestamp, value]]` entries. A payload may contain several frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct FramedFormat;

/// Maximum size of a single frame body.
const MAX_FRAME_SIZE: usize = u32::MAX as usize;

impl WireFormat for FramedFormat {
    fn name(&self) -> &'static str {
        "framed"
    }

    fn check(&self, datapoint: &Datapoint) -> Result<(), EncodeError> {
        if datapoint.name.is_empty() {
            return Err(EncodeError::InvalidName(datapoint.name.clone()));
        }
        check_value(datapoint)
    }

    fn encode(&self, batch: &[&Datapoint], out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let entries: Vec<(&str, (u64, f64))> = batch
            .iter()
            .map(|d| (d.name.as_str(), (d.timestamp.as_secs(), d.value)))
            .collect();

        let body = rmp_serde::to_vec(&entries)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(EncodeError::FrameTooLarge);
        }

        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(())
    }

    fn parse(&self, payload: &[u8]) -> Result<Vec<Datapoint>, DecodeError> {
        let mut datapoints = Vec::new();
        let mut rest = payload;

        while !rest.is_empty() {
            let (header, tail) = rest
                .split_first_chunk::<4>()
                .ok_or(DecodeError::Truncated)?;

            let length = u32::from_be_bytes(*header) as usize;
            if tail.len() < length {
                return Err(DecodeError::Truncated);
            }

            let (body, tail) = tail.split_at(length);
            let entries: Vec<(String, (u64, f64))> = rmp_serde::from_slice(body)?;
            datapoints.extend(entries.into_iter().map(|(name, (timestamp, value))| {
                Datapoint::new(name, value, UnixTimestamp::from_secs(timestamp))
            }));

            rest = tail;
        }

        Ok(datapoints)
    }
}

/// The wire format used to talk to destination nodes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plaintext lines, see [`LineFormat`].
    #[serde(alias = "plaintext")]
    Line,
    /// Length-prefixed frames, see [`FramedFormat`].
    #[default]
    #[serde(alias = "pickle")]
    Framed,
}

impl Protocol {
    /// Returns the shared serialization strategy for this protocol.
    pub fn wire_format(self) -> Arc<dyn WireFormat> {
        match self {
            Protocol::Line => Arc::new(LineFormat),
            Protocol::Framed => Arc::new(FramedFormat),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const T: UnixTimestamp = UnixTimestamp::from_secs(1700000000);

    fn sample_batch() -> Vec<Datapoint> {
        vec![
            Datapoint::new("foo", 5.0, T),
            Datapoint::new("bar.baz", 0.1, T),
            Datapoint::new("neg", -12.75, T),
            Datapoint::new("tiny", 1.0e-7, T),
            Datapoint::new("huge", 123456789012345680.0, T),
        ]
    }

    #[test]
    fn test_line_format() {
        let encoded = LineFormat.serialize(&[
            Datapoint::new("foo", 5.0, T),
            Datapoint::new("bar.baz", 0.25, T),
        ]);

        assert_eq!(
            std::str::from_utf8(&encoded.payload).unwrap(),
            "foo 5 1700000000\nbar.baz 0.25 1700000000\n"
        );
        assert_eq!(encoded.encoded, 2);
        assert_eq!(encoded.rejected, 0);
    }

    #[test]
    fn test_line_roundtrip() {
        let batch = sample_batch();
        let encoded = LineFormat.serialize(&batch);
        assert_eq!(LineFormat.parse(&encoded.payload).unwrap(), batch);
    }

    #[test]
    fn test_framed_roundtrip() {
        let batch = sample_batch();
        let encoded = FramedFormat.serialize(&batch);

        let length = u32::from_be_bytes(encoded.payload[..4].try_into().unwrap());
        assert_eq!(length as usize, encoded.payload.len() - 4);
        assert_eq!(FramedFormat.parse(&encoded.payload).unwrap(), batch);
    }

    #[test]
    fn test_framed_concatenated_frames() {
        let first = FramedFormat.serialize(&[Datapoint::new("a", 1.0, T)]);
        let second = FramedFormat.serialize(&[Datapoint::new("b", 2.0, T)]);
        let payload = [first.payload, second.payload].concat();

        let names: Vec<_> = FramedFormat
            .parse(&payload)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_framed_truncated() {
        let encoded = FramedFormat.serialize(&sample_batch());
        let truncated = &encoded.payload[..encoded.payload.len() - 1];
        assert!(matches!(
            FramedFormat.parse(truncated),
            Err(DecodeError::Truncated)
        ));
        assert!(matches!(
            FramedFormat.parse(&[0, 0]),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn test_non_finite_values_are_skipped() {
        let batch = vec![
            Datapoint::new("ok", 1.0, T),
            Datapoint::new("nan", f64::NAN, T),
            Datapoint::new("inf", f64::INFINITY, T),
            Datapoint::new("also.ok", 2.0, T),
        ];

        for format in [Protocol::Line.wire_format(), Protocol::Framed.wire_format()] {
            let encoded = format.serialize(&batch);
            assert_eq!(encoded.encoded, 2);
            assert_eq!(encoded.rejected, 2);

            let names: Vec<_> = format
                .parse(&encoded.payload)
                .unwrap()
                .into_iter()
                .map(|d| d.name)
                .collect();
            assert_eq!(names, ["ok", "also.ok"]);
        }
    }

    #[test]
    fn test_line_rejects_whitespace_in_names() {
        let batch = [Datapoint::new("has space", 1.0, T)];

        let encoded = LineFormat.serialize(&batch);
        assert_eq!(encoded.rejected, 1);
        assert!(encoded.payload.is_empty());

        let encoded = FramedFormat.serialize(&batch);
        assert_eq!(encoded.encoded, 1);
    }

    #[test]
    fn test_line_keeps_statsd_delimiters_in_names() {
        let batch = vec![
            Datapoint::new("host:8080.requests", 1.0, T),
            Datapoint::new("a|b", 2.0, T),
        ];

        let encoded = LineFormat.serialize(&batch);
        assert_eq!(encoded.rejected, 0);
        assert_eq!(LineFormat.parse(&encoded.payload).unwrap(), batch);
    }

    #[test]
    fn test_line_parse_errors() {
        assert!(matches!(
            LineFormat.parse(b"foo 1 1700000000\nbar 2\n"),
            Err(DecodeError::InvalidLine(2))
        ));
    }

    #[test]
    fn test_protocol_from_config() {
        let protocol: Protocol = serde_yaml::from_str("pickle").unwrap();
        assert_eq!(protocol, Protocol::Framed);
        let protocol: Protocol = serde_yaml::from_str("line").unwrap();
        assert_eq!(protocol, Protocol::Line);
    }
}
