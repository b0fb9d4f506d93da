use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use statsrelay_config::Config;
use statsrelay_forward::Router;
use statsrelay_system::{Addr, Service, channel};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::services::aggregator::{Aggregator, AggregatorService};
use crate::services::listener::{ListenerSettings, TcpListenerService, UdpListenerService};

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Binding the UDP listener failed.
    #[error("could not bind udp listener to {0}")]
    BindUdp(SocketAddr),

    /// Binding the TCP listener failed.
    #[error("could not bind tcp listener to {0}")]
    BindTcp(SocketAddr),

    /// The configured input rules are invalid.
    #[error("invalid input rules")]
    Rules,

    /// The forwarding configuration was rejected by the router.
    #[error("could not create router")]
    Router,
}

/// Addresses of all running services.
#[derive(Clone, Debug)]
pub struct Registry {
    /// The aggregator receiving samples from all listeners.
    pub aggregator: Addr<Aggregator>,
}

/// Server state.
///
/// Holds the running services until they stopped after a shutdown.
#[derive(Debug)]
pub struct ServiceState {
    config: Arc<Config>,
    registry: Registry,
    router: Arc<Router>,
    udp_addr: SocketAddr,
    tcp_addr: Option<SocketAddr>,
    handles: Vec<JoinHandle<()>>,
}

impl ServiceState {
    /// Binds the listeners and starts all services on the current runtime.
    pub async fn start(config: Arc<Config>) -> Result<Self> {
        let rules = config.rules().context(ServiceError::Rules)?;
        let router = Router::new(config.forward_config().clone()).context(ServiceError::Router)?;
        let router = Arc::new(router);
        router.start();

        let mut handles = Vec::new();

        let (aggregator, aggregator_rx) = channel(AggregatorService::name());
        let aggregator_service = AggregatorService::new(
            config.aggregator_config().clone(),
            rules,
            Arc::clone(&router),
        );
        handles.push(aggregator_service.spawn(aggregator_rx));

        let settings = Arc::new(ListenerSettings::from_config(&config));

        let listen_addr = config.listen_addr();
        let socket = UdpSocket::bind(listen_addr)
            .await
            .with_context(|| ServiceError::BindUdp(listen_addr))?;
        let udp_addr = socket.local_addr()?;
        let udp = UdpListenerService::new(socket, Arc::clone(&settings), aggregator.clone());
        let (_, udp_rx) = channel(UdpListenerService::name());
        handles.push(udp.spawn(udp_rx));

        let tcp_addr = match config.tcp_listen_addr() {
            Some(listen_addr) => {
                let listener = TcpListener::bind(listen_addr)
                    .await
                    .with_context(|| ServiceError::BindTcp(listen_addr))?;
                let tcp_addr = listener.local_addr()?;
                let tcp = TcpListenerService::new(listener, settings, aggregator.clone());
                let (_, tcp_rx) = channel(TcpListenerService::name());
                handles.push(tcp.spawn(tcp_rx));
                Some(tcp_addr)
            }
            None => None,
        };

        Ok(Self {
            config,
            registry: Registry { aggregator },
            router,
            udp_addr,
            tcp_addr,
            handles,
        })
    }

    /// Returns a reference to the configuration the services were started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the addresses of the running services.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the router delivering datapoints to destinations.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The address the UDP listener is bound to.
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// The address the TCP listener is bound to, if enabled.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Waits until all services stopped after a shutdown.
    ///
    /// The aggregator flushes its final window before it stops. Afterwards, destination
    /// connections drain their queues for at most the shutdown timeout.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(error) = handle.await {
                statsrelay_log::error!(
                    error = &error as &dyn std::error::Error,
                    "service terminated unexpectedly"
                );
            }
        }

        self.router.join().await;
    }
}
