use std::sync::Arc;
use std::time::Duration;

use statsrelay_config::Config;
use statsrelay_forward::WireFormat;
use statsrelay_metrics::Datapoint;
use statsrelay_server::{GetStats, ServiceState};
use statsrelay_test::MockNode;

/// Starts all services listening on ephemeral localhost ports and forwarding to `node`.
pub async fn start_server(node: &MockNode, protocol: &str) -> ServiceState {
    let yaml = format!(
        r#"
listener:
  host: 127.0.0.1
  port: 0
  tcp_port: 0
aggregator:
  flush_interval: 60000
forwarding:
  destinations: ["{}"]
  protocol: {protocol}
limits:
  shutdown_timeout: 5
"#,
        node.destination()
    );

    let config = Config::from_yaml_str(&yaml).unwrap();
    ServiceState::start(Arc::new(config)).await.unwrap()
}

/// Waits until the aggregator has recorded `count` samples.
pub async fn wait_for_samples(state: &ServiceState, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = state.registry().aggregator.send(GetStats).await.unwrap();
            if stats.samples_recorded >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("samples were not recorded in time");
}

/// Waits until `node` received a complete payload and decodes it.
pub async fn receive_datapoints(node: &MockNode, format: &dyn WireFormat) -> Vec<Datapoint> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut len = 1;
        loop {
            let payload = node.wait_for(len).await;
            match format.parse(&payload) {
                Ok(datapoints) if !datapoints.is_empty() => return datapoints,
                _ => len = payload.len() + 1,
            }
        }
    })
    .await
    .expect("node did not receive datapoints in time")
}
