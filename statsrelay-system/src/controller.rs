use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::watch;

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// After the timeout the system will shut down regardless of what the receivers of this message
/// do.
///
/// The return value is fully ignored. It is only `Result` such that futures can be executed inside
/// a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Global channel to notify all services of a shutdown.
static SHUTDOWN: Lazy<watch::Sender<Option<Shutdown>>> = Lazy::new(|| watch::channel(None).0);

/// Notifies a service about an upcoming shutdown.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the current shutdown state, if a shutdown has been requested.
    pub fn get(&self) -> Option<Shutdown> {
        self.0.borrow().clone()
    }

    /// Wait for a shutdown.
    ///
    /// This receives all shutdown signals since the [`Controller`] has been started, even before
    /// this shutdown handle has been obtained.
    ///
    /// # Cancellation
    ///
    /// This method is cancellation safe and can be used in `select!`.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            let current = self.0.borrow_and_update().clone();
            if let Some(shutdown) = current {
                return shutdown;
            }

            if self.0.changed().await.is_err() {
                // The sender lives in a static and is never dropped.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Service to start and gracefully stop the system runtime.
///
/// The controller listens for `SIGINT` and `SIGTERM` once [started](Self::start_signal_handler).
/// A `SIGTERM` requests a graceful shutdown with the configured timeout, `SIGINT` (Ctrl+C) forces
/// an immediate shutdown. A second signal always forces the shutdown.
///
/// Services obtain a [`ShutdownHandle`] and select on [`ShutdownHandle::notified`] in their main
/// loop.
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts listening for process signals on the current runtime.
    pub fn start_signal_handler(shutdown_timeout: Duration) {
        tokio::spawn(monitor_shutdown(shutdown_timeout));
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        ShutdownHandle(SHUTDOWN.subscribe())
    }

    /// Manually initiates the shutdown process of the system.
    pub fn shutdown(timeout: Option<Duration>) {
        SHUTDOWN.send_replace(Some(Shutdown { timeout }));
    }
}

#[cfg(unix)]
async fn monitor_shutdown(timeout: Duration) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sig_int, mut sig_term) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sig_int), Ok(sig_term)) => (sig_int, sig_term),
        (Err(error), _) | (_, Err(error)) => {
            statsrelay_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to register signal handlers"
            );
            return;
        }
    };

    let mut graceful = true;
    loop {
        tokio::select! {
            _ = sig_int.recv() => {
                statsrelay_log::info!("SIGINT received, exiting");
                Controller::shutdown(None);
            }
            _ = sig_term.recv(), if graceful => {
                statsrelay_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
                Controller::shutdown(Some(timeout));
                graceful = false;
            }
            _ = sig_term.recv() => {
                statsrelay_log::info!("second SIGTERM received, exiting");
                Controller::shutdown(None);
            }
        }
    }
}

#[cfg(not(unix))]
async fn monitor_shutdown(_timeout: Duration) {
    if tokio::signal::ctrl_c().await.is_ok() {
        statsrelay_log::info!("SIGINT received, exiting");
        Controller::shutdown(None);
    }
}
