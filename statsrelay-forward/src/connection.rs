use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use statsrelay_metrics::Datapoint;
use statsrelay_statsd::metric;
use statsrelay_system::{RetryBackoff, ShutdownHandle};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::statsd::{ForwardCounters, ForwardHistograms, ForwardTimers};
use crate::{DestinationNode, Encoded, ForwardConfig, OverflowPolicy, TransportKind, WireFormat};

/// The state of the transport of a [`Connection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No transport is open. The connection waits for its next reconnect attempt.
    Disconnected = 0,
    /// A connection attempt is in progress.
    Connecting = 1,
    /// The transport is open and the queue is being drained.
    Connected = 2,
}

impl ConnectionState {
    /// Returns the name of the state used in logs and metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reason a datapoint was dropped without being sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The send queue was at capacity.
    QueueFull,
    /// The destination stopped accepting datapoints after reaching its high watermark.
    Backpressure,
    /// The datapoint cannot be represented in the configured wire format.
    Unserializable,
    /// The datapoint was still queued when the connection was shut down or removed.
    Discarded,
}

impl DropReason {
    /// Returns the name of the reason used in metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Backpressure => "backpressure",
            Self::Unserializable => "unserializable",
            Self::Discarded => "discarded",
        }
    }
}

/// The result of [`Connection::enqueue`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    /// The datapoint was appended to the queue.
    Queued,
    /// The datapoint was appended after evicting the oldest queued datapoint.
    Evicted,
    /// The datapoint was rejected.
    Dropped(DropReason),
}

/// Counts of [`EnqueueOutcome`]s for a batch of datapoints.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EnqueueSummary {
    /// Datapoints admitted to the queue, including those that evicted an older datapoint.
    pub queued: usize,
    /// Datapoints lost because the queue was full. Evicted datapoints count here, too.
    pub queue_full: usize,
    /// Datapoints rejected while the destination was paused.
    pub backpressure: usize,
    /// Datapoints rejected because the connection was already closed.
    pub discarded: usize,
}

impl EnqueueSummary {
    fn add(&mut self, outcome: EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Queued => self.queued += 1,
            EnqueueOutcome::Evicted => {
                self.queued += 1;
                self.queue_full += 1;
            }
            EnqueueOutcome::Dropped(DropReason::Backpressure) => self.backpressure += 1,
            EnqueueOutcome::Dropped(DropReason::Discarded) => self.discarded += 1,
            EnqueueOutcome::Dropped(_) => self.queue_full += 1,
        }
    }

    /// The total number of datapoints dropped.
    pub fn dropped(&self) -> usize {
        self.queue_full + self.backpressure + self.discarded
    }
}

/// Whether a destination accepts more datapoints, returned by [`Connection::check_queue`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// The destination accepts datapoints.
    Open,
    /// The queue depth crossed the high watermark and has not yet fallen below the low watermark.
    Paused,
}

/// A point-in-time snapshot of the counters of a [`Connection`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    /// Current number of queued datapoints.
    pub queue_depth: usize,
    /// Datapoints admitted to the queue.
    pub queued: u64,
    /// Datapoints written to the transport.
    pub sent: u64,
    /// Datapoints put back into the queue after a failed send.
    pub requeued: u64,
    /// Datapoints dropped because the queue was full.
    pub dropped_queue_full: u64,
    /// Datapoints dropped while the destination was paused.
    pub dropped_backpressure: u64,
    /// Datapoints dropped because they could not be serialized.
    pub dropped_unserializable: u64,
    /// Datapoints discarded on shutdown or removal.
    pub dropped_discarded: u64,
    /// Number of transitions to [`ConnectionState::Disconnected`] after a failure.
    pub disconnects: u64,
}

impl ConnectionStats {
    /// The total number of dropped datapoints over all reasons.
    pub fn dropped(&self) -> u64 {
        self.dropped_queue_full
            + self.dropped_backpressure
            + self.dropped_unserializable
            + self.dropped_discarded
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    sent: AtomicU64,
    requeued: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_unserializable: AtomicU64,
    dropped_discarded: AtomicU64,
    disconnects: AtomicU64,
}

impl Counters {
    fn dropped(&self, reason: DropReason) -> &AtomicU64 {
        match reason {
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::Backpressure => &self.dropped_backpressure,
            DropReason::Unserializable => &self.dropped_unserializable,
            DropReason::Discarded => &self.dropped_discarded,
        }
    }
}

/// Errors of a single transport operation.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The destination host did not resolve to any address.
    #[error("destination did not resolve to an address")]
    Unresolved,
    /// The connection attempt did not finish in time.
    #[error("connect timed out")]
    ConnectTimeout,
    /// Writing a payload did not finish in time.
    #[error("send timed out")]
    SendTimeout,
    /// The transport failed.
    #[error("transport error")]
    Io(#[from] io::Error),
}

/// A bounded queue with watermark based admission.
#[derive(Debug)]
struct SendQueue {
    items: VecDeque<Datapoint>,
    capacity: usize,
    high_watermark: usize,
    low_watermark: usize,
    policy: OverflowPolicy,
    paused: bool,
}

impl SendQueue {
    fn new(config: &ForwardConfig) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: config.max_queue_size,
            high_watermark: config.high_watermark(),
            low_watermark: config.low_watermark(),
            policy: config.overflow_policy,
            paused: false,
        }
    }

    fn push(&mut self, datapoint: Datapoint) -> EnqueueOutcome {
        let outcome = match self.policy {
            OverflowPolicy::DropNewest if self.items.len() >= self.capacity => {
                return EnqueueOutcome::Dropped(DropReason::QueueFull);
            }
            OverflowPolicy::DropNewest if self.paused => {
                return EnqueueOutcome::Dropped(DropReason::Backpressure);
            }
            OverflowPolicy::DropOldest if self.items.len() >= self.capacity => {
                self.items.pop_front();
                EnqueueOutcome::Evicted
            }
            _ => EnqueueOutcome::Queued,
        };

        self.items.push_back(datapoint);
        if self.items.len() >= self.high_watermark {
            self.paused = true;
        }

        outcome
    }

    /// Puts a batch back in front of the queue, returning the number of datapoints lost.
    fn push_front(&mut self, batch: Vec<Datapoint>) -> usize {
        for datapoint in batch.into_iter().rev() {
            self.items.push_front(datapoint);
        }

        let mut trimmed = 0;
        while self.items.len() > self.capacity {
            match self.policy {
                OverflowPolicy::DropNewest => self.items.pop_back(),
                OverflowPolicy::DropOldest => self.items.pop_front(),
            };
            trimmed += 1;
        }

        self.check();
        trimmed
    }

    fn take(&mut self, max: usize) -> Vec<Datapoint> {
        let count = max.min(self.items.len());
        self.items.drain(..count).collect()
    }

    fn check(&mut self) -> Admission {
        if self.items.len() >= self.high_watermark {
            self.paused = true;
        } else if self.items.len() < self.low_watermark {
            self.paused = false;
        }

        match self.paused {
            true => Admission::Paused,
            false => Admission::Open,
        }
    }
}

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Transport {
    async fn connect(kind: TransportKind, node: &DestinationNode) -> Result<Self, ConnectionError> {
        let addr = (node.host(), node.port());

        Ok(match kind {
            TransportKind::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Self::Tcp(stream)
            }
            TransportKind::Udp => {
                let target = tokio::net::lookup_host(addr)
                    .await?
                    .next()
                    .ok_or(ConnectionError::Unresolved)?;

                let local: SocketAddr = match target {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };

                let socket = UdpSocket::bind(local).await?;
                socket.connect(target).await?;
                Self::Udp(socket)
            }
        })
    }

    /// The largest payload this transport writes in one operation.
    fn max_payload(&self, config: &ForwardConfig) -> usize {
        match self {
            Self::Tcp(_) => usize::MAX,
            Self::Udp(_) => config.max_datagram_size,
        }
    }

    async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => {
                stream.write_all(payload).await?;
                stream.flush().await
            }
            Self::Udp(socket) => socket.send(payload).await.map(drop),
        }
    }
}

/// A serialized part of a batch, written in one transport operation.
struct Chunk<'a> {
    datapoints: &'a [Datapoint],
    encoded: Encoded,
}

struct Inner {
    node: DestinationNode,
    label: String,
    config: Arc<ForwardConfig>,
    format: Arc<dyn WireFormat>,
    queue: Mutex<SendQueue>,
    state: AtomicU8,
    counters: Counters,
    wakeup: Notify,
    close: CancellationToken,
    sealed: CancellationToken,
}

/// The outbound link to a single destination node.
///
/// A connection owns a bounded send queue. [`enqueue`](Self::enqueue) never waits: it either
/// admits the datapoint or drops it according to the [`OverflowPolicy`] and the watermarks of the
/// queue. A background worker started with [`start`](Self::start) keeps the transport open,
/// reconnecting with capped exponential backoff, and drains the queue in batches of at most
/// `max_datapoints_per_message` datapoints. If a send fails, the batch is put back in front of the
/// queue and retried after reconnecting.
///
/// Connections are cheap to clone; all clones share the same queue and worker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates a connection in [`ConnectionState::Disconnected`] without starting its worker.
    pub fn new(
        node: DestinationNode,
        config: Arc<ForwardConfig>,
        format: Arc<dyn WireFormat>,
    ) -> Self {
        let queue = SendQueue::new(&config);

        Self {
            inner: Arc::new(Inner {
                label: node.to_string(),
                node,
                config,
                format,
                queue: Mutex::new(queue),
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                counters: Counters::default(),
                wakeup: Notify::new(),
                close: CancellationToken::new(),
                sealed: CancellationToken::new(),
            }),
        }
    }

    /// The destination node of this connection.
    pub fn node(&self) -> &DestinationNode {
        &self.inner.node
    }

    /// The current state of the transport.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Relaxed))
    }

    /// The number of queued datapoints.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().items.len()
    }

    /// Returns `true` if no datapoints are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a datapoint to the send queue.
    ///
    /// A closed connection rejects all datapoints with [`DropReason::Discarded`].
    pub fn enqueue(&self, datapoint: Datapoint) -> EnqueueOutcome {
        let outcome = {
            let mut queue = self.inner.queue.lock();
            self.admit(&mut queue, datapoint)
        };
        self.record_outcome(outcome);
        outcome
    }

    /// Appends a batch of datapoints to the send queue, in order.
    ///
    /// The queue lock is taken once for the whole batch.
    pub fn enqueue_all(&self, datapoints: impl IntoIterator<Item = Datapoint>) -> EnqueueSummary {
        let mut summary = EnqueueSummary::default();
        let outcomes: Vec<_> = {
            let mut queue = self.inner.queue.lock();
            datapoints
                .into_iter()
                .map(|d| self.admit(&mut queue, d))
                .collect()
        };

        for outcome in outcomes {
            self.record_outcome(outcome);
            summary.add(outcome);
        }

        summary
    }

    /// Re-evaluates the watermarks and returns whether this destination accepts datapoints.
    ///
    /// Once the queue depth reaches the high watermark, the destination is paused until the depth
    /// drops below the low watermark. The worker calls this after every successful send.
    pub fn check_queue(&self) -> Admission {
        self.inner.queue.lock().check()
    }

    /// Returns a snapshot of the counters of this connection.
    pub fn stats(&self) -> ConnectionStats {
        let c = &self.inner.counters;
        ConnectionStats {
            queue_depth: self.len(),
            queued: c.queued.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            dropped_queue_full: c.dropped_queue_full.load(Ordering::Relaxed),
            dropped_backpressure: c.dropped_backpressure.load(Ordering::Relaxed),
            dropped_unserializable: c.dropped_unserializable.load(Ordering::Relaxed),
            dropped_discarded: c.dropped_discarded.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
        }
    }

    /// Spawns the worker of this connection on the current runtime.
    ///
    /// The worker stops after [`close`](Self::close) or when `shutdown` fires. On a graceful
    /// shutdown it keeps draining the queue until the shutdown timeout elapses.
    pub fn start(&self, shutdown: ShutdownHandle) -> JoinHandle<()> {
        statsrelay_log::debug!(destination = %self.inner.label, "starting connection");
        tokio::spawn(self.clone().run(shutdown))
    }

    /// Stops the worker and discards all queued datapoints.
    pub fn close(&self) {
        self.inner.close.cancel();
    }

    /// Signals that no more datapoints will be enqueued.
    ///
    /// During a graceful shutdown, a sealed connection stops as soon as its queue is empty instead
    /// of waiting for the shutdown timeout.
    pub fn seal(&self) {
        self.inner.sealed.cancel();
    }

    /// Returns `true` if the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.close.is_cancelled()
    }

    /// Pushes into the locked queue unless the connection is closed.
    ///
    /// The worker discards the queue under the same lock after observing the close, so every
    /// admitted datapoint is either sent or counted as discarded.
    fn admit(&self, queue: &mut SendQueue, datapoint: Datapoint) -> EnqueueOutcome {
        if self.inner.close.is_cancelled() {
            return EnqueueOutcome::Dropped(DropReason::Discarded);
        }
        queue.push(datapoint)
    }

    fn record_outcome(&self, outcome: EnqueueOutcome) {
        let counters = &self.inner.counters;
        match outcome {
            EnqueueOutcome::Queued => {
                counters.queued.fetch_add(1, Ordering::Relaxed);
                self.inner.wakeup.notify_one();
            }
            EnqueueOutcome::Evicted => {
                counters.queued.fetch_add(1, Ordering::Relaxed);
                self.count_dropped(DropReason::QueueFull, 1);
                self.inner.wakeup.notify_one();
            }
            EnqueueOutcome::Dropped(reason) => self.count_dropped(reason, 1),
        }
    }

    fn count_dropped(&self, reason: DropReason, count: usize) {
        if count == 0 {
            return;
        }

        self.inner
            .counters
            .dropped(reason)
            .fetch_add(count as u64, Ordering::Relaxed);

        metric!(
            counter(ForwardCounters::DatapointsDropped) += count,
            destination = self.inner.label.as_str(),
            reason = reason.as_str(),
        );
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.swap(state as u8, Ordering::Relaxed);
        if previous == state as u8 {
            return;
        }

        statsrelay_log::trace!(destination = %self.inner.label, %state, "connection state changed");
        metric!(
            counter(ForwardCounters::ConnectionState) += 1,
            destination = self.inner.label.as_str(),
            state = state.as_str(),
        );
    }

    fn take_batch(&self) -> Vec<Datapoint> {
        let max = self.inner.config.max_datapoints_per_message;
        self.inner.queue.lock().take(max)
    }

    fn requeue_front(&self, batch: Vec<Datapoint>) {
        let count = batch.len();
        let trimmed = self.inner.queue.lock().push_front(batch);

        self.inner
            .counters
            .requeued
            .fetch_add(count as u64, Ordering::Relaxed);
        metric!(
            counter(ForwardCounters::DatapointsRequeued) += count,
            destination = self.inner.label.as_str(),
        );

        self.count_dropped(DropReason::QueueFull, trimmed);
    }

    fn discard_all(&self) {
        let discarded = {
            let mut queue = self.inner.queue.lock();
            let count = queue.items.len();
            queue.items.clear();
            queue.check();
            count
        };

        if discarded > 0 {
            statsrelay_log::warn!(
                destination = %self.inner.label,
                discarded,
                "discarding queued datapoints"
            );
        }

        self.count_dropped(DropReason::Discarded, discarded);
    }

    async fn connect(&self, backoff: &mut RetryBackoff) -> Result<Transport, ConnectionError> {
        let delay = backoff.next_backoff();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.set_state(ConnectionState::Connecting);
        let config = &self.inner.config;
        let result = tokio::time::timeout(
            config.connect_timeout(),
            Transport::connect(config.transport, &self.inner.node),
        )
        .await
        .unwrap_or(Err(ConnectionError::ConnectTimeout));

        match result {
            Ok(transport) => {
                statsrelay_log::info!(destination = %self.inner.label, "connected to destination");
                backoff.reset();
                self.set_state(ConnectionState::Connected);
                Ok(transport)
            }
            Err(error) => {
                // Only the first failure of a series is worth a warning.
                if backoff.attempt() <= 1 {
                    statsrelay_log::warn!(
                        error = &error as &dyn std::error::Error,
                        destination = %self.inner.label,
                        "failed to connect to destination"
                    );
                } else {
                    statsrelay_log::debug!(
                        error = &error as &dyn std::error::Error,
                        destination = %self.inner.label,
                        attempt = backoff.attempt(),
                        "failed to connect to destination"
                    );
                }

                self.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    /// Serializes `batch` into payloads of at most `limit` bytes.
    ///
    /// Payloads over the limit are split in halves until they fit. A single datapoint that does
    /// not fit on its own is dropped as unserializable, since retrying it can never succeed.
    fn encode_chunks<'a>(
        &self,
        batch: &'a [Datapoint],
        limit: usize,
        chunks: &mut Vec<Chunk<'a>>,
    ) {
        if batch.is_empty() {
            return;
        }

        let encoded = self.inner.format.serialize(batch);
        if encoded.encoded == 0 || encoded.payload.len() <= limit {
            self.count_dropped(DropReason::Unserializable, encoded.rejected);
            if encoded.encoded > 0 {
                chunks.push(Chunk {
                    datapoints: batch,
                    encoded,
                });
            }
            return;
        }

        if let [datapoint] = batch {
            statsrelay_log::debug!(
                destination = %self.inner.label,
                name = %datapoint.name,
                size = encoded.payload.len(),
                limit,
                "datapoint exceeds the maximum payload size"
            );
            self.count_dropped(DropReason::Unserializable, 1);
            return;
        }

        let (left, right) = batch.split_at(batch.len() / 2);
        self.encode_chunks(left, limit, chunks);
        self.encode_chunks(right, limit, chunks);
    }

    /// Serializes and writes one batch.
    ///
    /// On failure, all datapoints that were not written are requeued.
    async fn send(
        &self,
        transport: &mut Transport,
        mut batch: Vec<Datapoint>,
    ) -> Result<(), ConnectionError> {
        let format = &self.inner.format;

        let before = batch.len();
        batch.retain(|datapoint| format.check(datapoint).is_ok());
        self.count_dropped(DropReason::Unserializable, before - batch.len());

        let mut chunks = Vec::new();
        let limit = transport.max_payload(&self.inner.config);
        self.encode_chunks(&batch, limit, &mut chunks);

        for (index, chunk) in chunks.iter().enumerate() {
            if let Err(error) = self.write(transport, &chunk.encoded).await {
                let unsent = chunks[index..]
                    .iter()
                    .flat_map(|chunk| chunk.datapoints.iter().cloned())
                    .collect();
                self.requeue_front(unsent);
                return Err(error);
            }
        }

        self.check_queue();
        Ok(())
    }

    async fn write(
        &self,
        transport: &mut Transport,
        encoded: &Encoded,
    ) -> Result<(), ConnectionError> {
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.inner.config.send_timeout(),
            transport.send(&encoded.payload),
        )
        .await;

        match result {
            Ok(Ok(())) => (),
            Ok(Err(error)) => return Err(ConnectionError::Io(error)),
            Err(_) => return Err(ConnectionError::SendTimeout),
        }

        let label = self.inner.label.as_str();
        self.inner
            .counters
            .sent
            .fetch_add(encoded.encoded as u64, Ordering::Relaxed);

        metric!(
            counter(ForwardCounters::DatapointsSent) += encoded.encoded,
            destination = label,
        );
        metric!(
            histogram(ForwardHistograms::BatchSize) = encoded.encoded,
            destination = label,
        );
        metric!(
            histogram(ForwardHistograms::PayloadSize) = encoded.payload.len(),
            destination = label,
        );
        metric!(
            timer(ForwardTimers::SendDuration) = start.elapsed(),
            destination = label,
        );

        Ok(())
    }

    fn disconnect(&self, error: &ConnectionError) {
        statsrelay_log::warn!(
            error = error as &dyn std::error::Error,
            destination = %self.inner.label,
            "lost connection to destination"
        );

        self.inner.counters.disconnects.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run(self, mut shutdown: ShutdownHandle) {
        let config = &self.inner.config;
        let mut backoff = RetryBackoff::with_initial(
            config.reconnect_initial_interval(),
            config.reconnect_max_interval(),
        );
        let mut transport = None;

        loop {
            if self.inner.close.is_cancelled() {
                self.discard_all();
                break;
            }

            if let Some(signal) = shutdown.get() {
                self.drain(transport.take(), &mut backoff, signal.timeout)
                    .await;
                break;
            }

            let Some(current) = transport.as_mut() else {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => (),
                    _ = self.inner.close.cancelled() => (),
                    result = self.connect(&mut backoff) => transport = result.ok(),
                }
                continue;
            };

            let batch = self.take_batch();
            if batch.is_empty() {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => (),
                    _ = self.inner.close.cancelled() => (),
                    _ = self.inner.wakeup.notified() => (),
                }
                continue;
            }

            if let Err(error) = self.send(current, batch).await {
                self.disconnect(&error);
                transport = None;
            }
        }

        // Nothing drains the queue from here on.
        self.inner.close.cancel();
        self.discard_all();

        self.set_state(ConnectionState::Disconnected);
        statsrelay_log::debug!(destination = %self.inner.label, "connection stopped");
    }

    /// Sends as much of the queue as possible before the shutdown deadline, then discards the rest.
    ///
    /// Datapoints enqueued while draining are sent as well, until the connection is sealed.
    async fn drain(
        &self,
        mut transport: Option<Transport>,
        backoff: &mut RetryBackoff,
        timeout: Option<Duration>,
    ) {
        let Some(timeout) = timeout else {
            self.discard_all();
            return;
        };

        let drain = async {
            loop {
                if self.is_empty() {
                    if self.inner.sealed.is_cancelled() {
                        break;
                    }

                    tokio::select! {
                        _ = self.inner.sealed.cancelled() => (),
                        _ = self.inner.wakeup.notified() => (),
                    }
                    continue;
                }

                if transport.is_none() {
                    match self.connect(backoff).await {
                        Ok(connected) => transport = Some(connected),
                        Err(_) => continue,
                    }
                }

                let Some(current) = transport.as_mut() else {
                    continue;
                };

                let batch = self.take_batch();
                if let Err(error) = self.send(current, batch).await {
                    self.disconnect(&error);
                    transport = None;
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(timeout) => (),
            _ = self.inner.close.cancelled() => (),
            _ = drain => (),
        }

        self.discard_all();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.inner.node)
            .field("state", &self.state())
            .field("format", &self.inner.format.name())
            .finish()
    }
}
