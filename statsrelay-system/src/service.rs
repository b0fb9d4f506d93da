use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

/// A message interface for [services](Service).
///
/// Most commonly, this is an enumeration of all messages a service handles. Each variant carries
/// a message and, for messages with a response, the [`Sender`] to answer with.
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// Response behavior of an [`Interface`] message.
///
/// Determines what the [`Addr::send`] call returns and what the service receives to answer.
pub trait MessageResponse {
    /// Sends the response from the service back to the caller.
    type Sender;

    /// The value returned by [`Addr::send`].
    type Output;

    /// Returns the sender and output halves of a new response channel.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request does not have a response.
///
/// Sending a message is fire-and-forget, [`Addr::send`] returns `()`.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// The service responds asynchronously through a [`Sender`].
pub struct AsyncResponse<T>(PhantomData<fn(T)>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

impl<T> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("open", &!self.0.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Sends the response value. Responses to requests that were dropped are discarded.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

/// The future returned by [`Addr::send`] for messages with an [`AsyncResponse`].
///
/// Resolves to [`SendError`] if the service dropped the message without responding.
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Request")
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map_err(|_| SendError)
    }
}

/// Declares a message as part of an [`Interface`].
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value of [`Addr::send`].
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running. They can be freely cloned.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("open", &!self.tx.is_closed())
            .field("queue_size", &self.len())
            .finish()
    }
}

impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queue_size: self.queue_size.clone(),
        }
    }
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service.
    ///
    /// The channel is unbounded, the message is enqueued immediately. Messages sent to a service
    /// that has shut down are silently discarded; requests then resolve to [`SendError`].
    pub fn send<M>(&self, message: M) -> <I::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = <I::Response as MessageResponse>::channel();
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(I::from_message(message, tx)).is_err() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
        }
        rx
    }

    /// Returns the number of messages waiting in the service's queue.
    pub fn len(&self) -> u64 {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Returns `true` if no messages are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an address that discards all messages, useful in tests.
    pub fn dummy() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            tx,
            queue_size: Default::default(),
        }
    }
}

/// Inbound channel for messages sent through an [`Addr`].
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
    name: &'static str,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next message, or `None` once all addresses are dropped.
    pub async fn recv(&mut self) -> Option<I> {
        let message = self.rx.recv().await?;
        self.queue_size.fetch_sub(1, Ordering::SeqCst);
        Some(message)
    }

    /// The name of the service owning this receiver.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .finish()
    }
}

/// Creates an unbounded channel for communicating with a [`Service`].
pub fn channel<I: Interface>(name: &'static str) -> (Addr<I>, Receiver<I>) {
    let queue_size = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let addr = Addr {
        tx,
        queue_size: queue_size.clone(),
    };

    let receiver = Receiver {
        rx,
        name,
        queue_size,
    };

    (addr, receiver)
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to [`Interface`] through an [`Addr`] and handle them one
/// by one in [`run`](Self::run). Internally, services are free to concurrently process messages.
///
/// # Example
///
/// ```
/// use statsrelay_system::{FromMessage, Interface, NoResponse, Receiver, Service};
///
/// struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<Self> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
///
/// struct MyService;
///
/// impl Service for MyService {
///     type Interface = MyMessage;
///
///     async fn run(self, mut rx: Receiver<Self::Interface>) {
///         while let Some(_message) = rx.recv().await {
///             // handle the message
///         }
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let addr = MyService.start_detached();
/// addr.send(MyMessage);
/// # }
/// ```
pub trait Service: Sized + Send + 'static {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Runs the service to completion, handling messages from `rx`.
    ///
    /// The service should exit once all addresses are dropped and `rx` returns `None`.
    fn run(self, rx: Receiver<Self::Interface>) -> impl Future<Output = ()> + Send + 'static;

    /// Starts the service on the current runtime and returns its address.
    fn start_detached(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel(Self::name());
        self.spawn(rx);
        addr
    }

    /// Spawns the service with an existing receiver and returns a handle to its task.
    fn spawn(self, rx: Receiver<Self::Interface>) -> tokio::task::JoinHandle<()> {
        statsrelay_log::debug!(service = rx.name(), "starting service");
        tokio::spawn(self.run(rx))
    }

    /// Returns a unique name for this service implementation.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u32);

    enum Echo {
        Ping(Ping, Sender<u32>),
        Poke,
    }

    impl Interface for Echo {}

    impl FromMessage<Ping> for Echo {
        type Response = AsyncResponse<u32>;

        fn from_message(message: Ping, sender: Sender<u32>) -> Self {
            Self::Ping(message, sender)
        }
    }

    struct Poke;

    impl FromMessage<Poke> for Echo {
        type Response = NoResponse;

        fn from_message(_: Poke, _: ()) -> Self {
            Self::Poke
        }
    }

    struct EchoService {
        pokes: Arc<AtomicU64>,
    }

    impl Service for EchoService {
        type Interface = Echo;

        async fn run(self, mut rx: Receiver<Self::Interface>) {
            while let Some(message) = rx.recv().await {
                match message {
                    Echo::Ping(Ping(value), sender) => sender.send(value + 1),
                    Echo::Poke => {
                        self.pokes.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let pokes = Arc::new(AtomicU64::new(0));
        let addr = EchoService {
            pokes: pokes.clone(),
        }
        .start_detached();

        addr.send(Poke);
        addr.send(Poke);
        assert_eq!(addr.send(Ping(41)).await, Ok(42));
        assert_eq!(pokes.load(Ordering::SeqCst), 2);
        assert!(addr.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_stopped_service() {
        let (addr, rx) = channel::<Echo>("echo");
        drop(rx);
        assert_eq!(addr.send(Ping(1)).await, Err(SendError));
        assert_eq!(addr.len(), 0);
    }
}
