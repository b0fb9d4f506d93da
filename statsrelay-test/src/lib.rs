//! Helpers for testing statsrelay services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner.
//!  - Use a [`MockNode`] wherever a downstream storage node is needed. It accepts any number of
//!    TCP connections and records all bytes it receives.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! statsrelay_test::setup();
//!
//! let node = statsrelay_test::MockNode::start().await;
//! let payload = node.wait_for(16).await;
//! # }
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all other logs.
pub fn setup() {
    statsrelay_log::init_test!();
}

#[derive(Debug, Default)]
struct Received {
    data: Mutex<Vec<u8>>,
    connections: AtomicUsize,
    notify: Notify,
}

/// A downstream node that records everything written to it.
///
/// The node listens on an ephemeral port on localhost. Data from all connections is appended to
/// a single buffer in the order it is read. The listener stops when the node is dropped.
#[derive(Debug)]
pub struct MockNode {
    addr: SocketAddr,
    received: Arc<Received>,
    handle: JoinHandle<()>,
}

impl MockNode {
    /// Binds a new node and starts accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind mock node");
        let addr = listener.local_addr().expect("mock node address");

        let received = Arc::new(Received::default());
        let handle = tokio::spawn(accept_loop(listener, Arc::clone(&received)));

        Self {
            addr,
            received,
            handle,
        }
    }

    /// The address the node listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The port the node listens on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Returns `host:port` of this node.
    pub fn destination(&self) -> String {
        self.addr.to_string()
    }

    /// Returns a copy of all bytes received so far.
    pub fn received(&self) -> Vec<u8> {
        self.received.data.lock().clone()
    }

    /// The number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.received.connections.load(Ordering::Relaxed)
    }

    /// Waits until at least `len` bytes have been received and returns them.
    ///
    /// This waits forever. Wrap it in a timeout if the test can fail by not receiving data.
    pub async fn wait_for(&self, len: usize) -> Vec<u8> {
        loop {
            let notified = self.received.notify.notified();
            {
                let data = self.received.data.lock();
                if data.len() >= len {
                    return data.clone();
                }
            }
            notified.await;
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, received: Arc<Received>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        received.connections.fetch_add(1, Ordering::Relaxed);

        let received = Arc::clone(&received);
        tokio::spawn(async move {
            let mut buf = [0; 4096];
            while let Ok(read @ 1..) = stream.read(&mut buf).await {
                received.data.lock().extend_from_slice(&buf[..read]);
                received.notify.notify_waiters();
            }
        });
    }
}
