use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use statsrelay_config::Config;
use statsrelay_metrics::Sample;
use statsrelay_statsd::metric;
use statsrelay_system::{Addr, Controller, Receiver, Service};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::services::aggregator::{Aggregator, RecordSamples};
use crate::statsd::{ServerCounters, ServerHistograms};

/// Maximum number of samples a TCP connection collects before handing them to the aggregator.
const MAX_TCP_BATCH: usize = 1000;

/// Settings shared by the UDP and TCP listeners.
#[derive(Debug)]
pub struct ListenerSettings {
    /// A message answered with `monitor_response` instead of being parsed.
    pub monitor_message: String,
    /// The response to `monitor_message`.
    pub monitor_response: String,
    /// The size of the datagram receive buffer.
    pub max_datagram_size: usize,
    /// Log every received line at info level.
    pub dump_mode: bool,
}

impl ListenerSettings {
    /// Extracts the listener settings from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            monitor_message: config.monitor_message().to_owned(),
            monitor_response: config.monitor_response().to_owned(),
            max_datagram_size: config.max_datagram_size(),
            dump_mode: config.aggregator_config().dump_mode,
        }
    }

    fn is_monitor(&self, payload: &[u8]) -> bool {
        !self.monitor_message.is_empty()
            && payload.trim_ascii_end() == self.monitor_message.as_bytes()
    }

    /// Parses all lines of `payload` into `samples`, skipping lines that fail to parse.
    fn parse_into(&self, payload: &[u8], transport: &'static str, samples: &mut Vec<Sample>) {
        let before = samples.len();

        for line in payload.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            if self.dump_mode {
                statsrelay_log::info!("In: {}", String::from_utf8_lossy(line));
            }

            match Sample::parse(line) {
                Ok(sample) => samples.push(sample),
                Err(error) => {
                    statsrelay_log::debug!(
                        error = &error as &dyn Error,
                        line = %String::from_utf8_lossy(line),
                        "dropping invalid statsd line"
                    );
                    metric!(counter(ServerCounters::SamplesRejected) += 1, reason = "parse");
                }
            }
        }

        metric!(
            counter(ServerCounters::SamplesReceived) += samples.len() - before,
            transport = transport
        );
    }
}

/// Receives statsd datagrams and forwards the parsed samples to the [`Aggregator`].
///
/// Each datagram may contain multiple newline separated samples. A datagram matching the monitor
/// message is answered to its sender and not parsed.
pub struct UdpListenerService {
    socket: UdpSocket,
    settings: Arc<ListenerSettings>,
    aggregator: Addr<Aggregator>,
}

impl UdpListenerService {
    /// Creates a listener on an already bound socket.
    pub fn new(
        socket: UdpSocket,
        settings: Arc<ListenerSettings>,
        aggregator: Addr<Aggregator>,
    ) -> Self {
        Self {
            socket,
            settings,
            aggregator,
        }
    }

    async fn handle_datagram(&self, payload: &[u8], peer: SocketAddr) {
        metric!(counter(ServerCounters::DatagramsReceived) += 1);
        metric!(histogram(ServerHistograms::DatagramSize) = payload.len());

        if self.settings.is_monitor(payload) {
            metric!(counter(ServerCounters::MonitorRequests) += 1, transport = "udp");
            let response = self.settings.monitor_response.as_bytes();
            if let Err(error) = self.socket.send_to(response, peer).await {
                statsrelay_log::debug!(
                    error = &error as &dyn Error,
                    %peer,
                    "failed to answer monitor message"
                );
            }
            return;
        }

        let mut samples = Vec::new();
        self.settings.parse_into(payload, "udp", &mut samples);
        if !samples.is_empty() {
            self.aggregator.send(RecordSamples { samples });
        }
    }
}

impl Service for UdpListenerService {
    type Interface = ();

    async fn run(self, _rx: Receiver<Self::Interface>) {
        let mut shutdown = Controller::shutdown_handle();
        let mut buffer = vec![0; self.settings.max_datagram_size];

        match self.socket.local_addr() {
            Ok(addr) => statsrelay_log::info!("statsd listener on udp://{addr}"),
            Err(_) => statsrelay_log::info!("statsd listener on udp"),
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((len, peer)) => self.handle_datagram(&buffer[..len], peer).await,
                    Err(error) => statsrelay_log::debug!(
                        error = &error as &dyn Error,
                        "failed to receive datagram"
                    ),
                },
            }
        }

        statsrelay_log::info!("udp listener stopped");
    }
}

/// Accepts TCP connections carrying newline delimited statsd samples.
///
/// Every connection is served by its own task. A line matching the monitor message is answered on
/// the same connection.
pub struct TcpListenerService {
    listener: TcpListener,
    settings: Arc<ListenerSettings>,
    aggregator: Addr<Aggregator>,
}

impl TcpListenerService {
    /// Creates a listener on an already bound socket.
    pub fn new(
        listener: TcpListener,
        settings: Arc<ListenerSettings>,
        aggregator: Addr<Aggregator>,
    ) -> Self {
        Self {
            listener,
            settings,
            aggregator,
        }
    }
}

impl Service for TcpListenerService {
    type Interface = ();

    async fn run(self, _rx: Receiver<Self::Interface>) {
        let mut shutdown = Controller::shutdown_handle();

        match self.listener.local_addr() {
            Ok(addr) => statsrelay_log::info!("statsd listener on tcp://{addr}"),
            Err(_) => statsrelay_log::info!("statsd listener on tcp"),
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        metric!(counter(ServerCounters::TcpConnectionsAccepted) += 1);
                        statsrelay_log::debug!(%peer, "accepted statsd connection");
                        tokio::spawn(serve_connection(
                            stream,
                            Arc::clone(&self.settings),
                            self.aggregator.clone(),
                        ));
                    }
                    Err(error) => statsrelay_log::warn!(
                        error = &error as &dyn Error,
                        "failed to accept statsd connection"
                    ),
                },
            }
        }

        statsrelay_log::info!("tcp listener stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    settings: Arc<ListenerSettings>,
    aggregator: Addr<Aggregator>,
) {
    let mut shutdown = Controller::shutdown_handle();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = Vec::new();
    let mut samples = Vec::new();

    loop {
        line.clear();

        let read = tokio::select! {
            biased;

            _ = shutdown.notified() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => (),
            Err(error) => {
                statsrelay_log::debug!(
                    error = &error as &dyn Error,
                    "failed to read from statsd connection"
                );
                break;
            }
        }

        if settings.is_monitor(&line) {
            metric!(counter(ServerCounters::MonitorRequests) += 1, transport = "tcp");
            let mut response = settings.monitor_response.clone().into_bytes();
            response.push(b'\n');
            if writer.write_all(&response).await.is_err() {
                break;
            }
        } else {
            settings.parse_into(&line, "tcp", &mut samples);
        }

        // Batch all lines that arrived together.
        if !samples.is_empty() && (reader.buffer().is_empty() || samples.len() >= MAX_TCP_BATCH) {
            aggregator.send(RecordSamples {
                samples: std::mem::take(&mut samples),
            });
        }
    }

    if !samples.is_empty() {
        aggregator.send(RecordSamples { samples });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dump_mode: bool) -> ListenerSettings {
        ListenerSettings {
            monitor_message: "statsrelay ping".to_owned(),
            monitor_response: "statsrelay pong".to_owned(),
            max_datagram_size: 65_535,
            dump_mode,
        }
    }

    #[test]
    fn test_monitor_message() {
        let settings = settings(false);
        assert!(settings.is_monitor(b"statsrelay ping"));
        assert!(settings.is_monitor(b"statsrelay ping\r\n"));
        assert!(!settings.is_monitor(b"statsrelay ping:1|c"));
    }

    #[test]
    fn test_empty_monitor_message_disabled() {
        let settings = ListenerSettings {
            monitor_message: String::new(),
            ..settings(false)
        };
        assert!(!settings.is_monitor(b""));
    }

    #[test]
    fn test_parse_skips_invalid_lines() {
        statsrelay_test::setup();

        let mut samples = Vec::new();
        settings(true).parse_into(
            b"foo:1|c\r\n\nnot a sample\nbar:250|ms|@0.5\nbaz:x|g",
            "udp",
            &mut samples,
        );

        let names: Vec<_> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["foo", "bar"]);
        assert_eq!(samples[1].sample_rate, 0.5);
    }
}
