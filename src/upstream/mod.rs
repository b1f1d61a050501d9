use crate::broker::StreamBroker;
use crate::ledger::ErrorKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Connectivity of the simulation source itself, independent of any broker
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub connected: bool,
    pub simulation_running: bool,
    pub simulation_time: f64,
    pub vehicle_count: usize,
}

impl UpstreamStatus {
    pub fn offline() -> Self {
        Self {
            connected: false,
            simulation_running: false,
            simulation_time: 0.0,
            vehicle_count: 0,
        }
    }
}

/// Abstract control surface of the simulation source. The source itself is
/// an external collaborator; this crate only consumes connect, disconnect
/// and status.
#[async_trait]
pub trait UpstreamControl: Send + Sync {
    async fn connect(&self) -> anyhow::Result<UpstreamStatus>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn status(&self) -> anyhow::Result<UpstreamStatus>;
}

/// Stand-in used when no simulation source is attached; always reports
/// offline.
pub struct OfflineUpstream;

#[async_trait]
impl UpstreamControl for OfflineUpstream {
    async fn connect(&self) -> anyhow::Result<UpstreamStatus> {
        Ok(UpstreamStatus::offline())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<UpstreamStatus> {
        Ok(UpstreamStatus::offline())
    }
}

/// Periodically publish upstream connectivity to every viewer.
///
/// Status polling failures are recorded and reported as a disconnected
/// source; they never interrupt the publisher.
pub async fn run_status_publisher(
    broker: Arc<StreamBroker>,
    upstream: Arc<dyn UpstreamControl>,
    interval_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let status = match upstream.status().await {
            Ok(status) => serde_json::to_value(&status).unwrap_or_else(|_| json!(null)),
            Err(e) => {
                broker.ledger().record(
                    ErrorKind::Connection,
                    format!("upstream status poll failed: {}", e),
                    None,
                );
                json!({ "connected": false, "error": e.to_string() })
            }
        };
        let delivered = broker.broadcast_upstream_status(status);
        debug!(delivered, "published upstream status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::ledger::ErrorLedger;

    #[tokio::test]
    async fn offline_upstream_reports_disconnected() {
        let upstream = OfflineUpstream;
        let status = upstream.status().await.unwrap();
        assert!(!status.connected);
        assert!(!status.simulation_running);
        assert_eq!(status.vehicle_count, 0);
    }

    #[tokio::test]
    async fn failed_poll_is_recorded_and_reported_as_offline() {
        struct FlakyUpstream;

        #[async_trait]
        impl UpstreamControl for FlakyUpstream {
            async fn connect(&self) -> anyhow::Result<UpstreamStatus> {
                anyhow::bail!("bridge unreachable")
            }
            async fn disconnect(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn status(&self) -> anyhow::Result<UpstreamStatus> {
                anyhow::bail!("bridge unreachable")
            }
        }

        let ledger = Arc::new(ErrorLedger::default());
        let broker = Arc::new(StreamBroker::new(BrokerConfig::default(), Arc::clone(&ledger)));
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        broker.register(tx);
        rx.try_recv().unwrap(); // welcome

        let publisher = tokio::spawn(run_status_publisher(
            Arc::clone(&broker),
            Arc::new(FlakyUpstream),
            1,
        ));

        let frame = rx.recv().await.unwrap();
        publisher.abort();

        assert_eq!(frame.kind, "sumo-connection-status");
        let data = frame.data.unwrap();
        assert_eq!(data["connected"], false);
        assert_eq!(ledger.by_kind(ErrorKind::Connection, None).len(), 1);
    }
}
