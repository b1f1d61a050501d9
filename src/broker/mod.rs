use crate::config::BrokerConfig;
use crate::ledger::ErrorLedger;
use crate::record::{Category, MetricsSnapshot};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod connection;
pub mod protocol;
#[cfg(test)]
mod tests;

pub use connection::handle_connection;
pub use protocol::{ClientRequest, Envelope, SimulationUpdate};

/// Connection lifecycle notifications, observable by whoever composes the
/// broker.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Connected {
        id: Uuid,
    },
    Disconnected {
        id: Uuid,
    },
    SubscriptionChanged {
        id: Uuid,
        category: Category,
        subscribed: bool,
    },
}

/// Unicast delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    UnknownConnection(Uuid),
    Saturated(Uuid),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::UnknownConnection(id) => write!(f, "no connection with id {}", id),
            SendError::Saturated(id) => {
                write!(f, "outbound buffer for connection {} is full", id)
            }
        }
    }
}

impl std::error::Error for SendError {}

struct ConnectionEntry {
    subscriptions: HashSet<Category>,
    outbound: mpsc::Sender<Envelope>,
}

/// Server-side stream broker: owns the set of connected viewers and their
/// subscription sets, and fans each batch out only to the viewers that asked
/// for its category.
///
/// Delivery is best-effort per peer. Every connection has an independent
/// bounded outbound buffer; a saturated peer loses the frame rather than
/// delaying anyone else.
pub struct StreamBroker {
    config: BrokerConfig,
    connections: DashMap<Uuid, ConnectionEntry>,
    events_tx: broadcast::Sender<BrokerEvent>,
    ledger: Arc<ErrorLedger>,
    dropped_frames: AtomicU64,
}

impl StreamBroker {
    pub fn new(config: BrokerConfig, ledger: Arc<ErrorLedger>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            config,
            connections: DashMap::new(),
            events_tx,
            ledger,
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ErrorLedger> {
        &self.ledger
    }

    /// Register a new connection with an empty subscription set and queue
    /// the welcome message. Returns the connection id.
    pub fn register(&self, outbound: mpsc::Sender<Envelope>) -> Uuid {
        let id = Uuid::new_v4();
        let welcome = Envelope::connection_established(json!({
            "connectionId": id,
            "server": "artery",
            "version": env!("CARGO_PKG_VERSION"),
            "categories": Category::ALL,
        }));
        let _ = outbound.try_send(welcome);

        self.connections.insert(
            id,
            ConnectionEntry {
                subscriptions: HashSet::new(),
                outbound,
            },
        );
        let _ = self.events_tx.send(BrokerEvent::Connected { id });
        id
    }

    /// Drop the connection and its subscription set.
    pub fn deregister(&self, id: Uuid) {
        if self.connections.remove(&id).is_some() {
            let _ = self.events_tx.send(BrokerEvent::Disconnected { id });
        }
    }

    /// Add `category` to the connection's subscription set. Idempotent:
    /// re-subscribing is a no-op apart from the confirmation reply.
    pub fn subscribe(&self, id: Uuid, category: Category) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        let changed = entry.subscriptions.insert(category);
        let _ = entry
            .outbound
            .try_send(Envelope::subscription_confirmed(category));
        drop(entry);

        if changed {
            info!(connection = %id, category = %category, "client subscribed");
            let _ = self.events_tx.send(BrokerEvent::SubscriptionChanged {
                id,
                category,
                subscribed: true,
            });
        }
        changed
    }

    /// Remove `category` from the connection's subscription set. A no-op
    /// when the category was never subscribed.
    pub fn unsubscribe(&self, id: Uuid, category: Category) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        let changed = entry.subscriptions.remove(&category);
        drop(entry);

        if changed {
            info!(connection = %id, category = %category, "client unsubscribed");
            let _ = self.events_tx.send(BrokerEvent::SubscriptionChanged {
                id,
                category,
                subscribed: false,
            });
        }
        changed
    }

    /// Current subscription set for a connection.
    pub fn subscriptions(&self, id: Uuid) -> Option<HashSet<Category>> {
        self.connections.get(&id).map(|e| e.subscriptions.clone())
    }

    /// Fan a category batch out to every subscribed connection. Returns the
    /// number of peers the frame was queued for.
    pub fn broadcast(&self, category: Category, data: Value) -> usize {
        let envelope = Envelope::batch(category, data);
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if !entry.subscriptions.contains(&category) {
                continue;
            }
            if self.deliver(*entry.key(), &entry.outbound, envelope.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Combined tick, filtered per peer: each connection receives only the
    /// categories it subscribed to, applied as one message. Peers with no
    /// matching category receive nothing.
    pub fn broadcast_simulation_update(&self, update: &SimulationUpdate) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            let Some(filtered) = update.filtered(&entry.subscriptions) else {
                continue;
            };
            let envelope = Envelope::simulation_update(filtered);
            if self.deliver(*entry.key(), &entry.outbound, envelope) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Aggregate metrics go to every viewer; they are not a subscription
    /// category.
    pub fn broadcast_metrics(&self, snapshot: &MetricsSnapshot) -> usize {
        self.broadcast_all(Envelope::metrics(snapshot))
    }

    /// Upstream-source connectivity, likewise delivered to every viewer.
    pub fn broadcast_upstream_status(&self, status: Value) -> usize {
        self.broadcast_all(Envelope::upstream_status(status))
    }

    fn broadcast_all(&self, envelope: Envelope) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if self.deliver(*entry.key(), &entry.outbound, envelope.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Unicast to one connection.
    pub fn send_to_connection(&self, id: Uuid, envelope: Envelope) -> Result<(), SendError> {
        let Some(entry) = self.connections.get(&id) else {
            return Err(SendError::UnknownConnection(id));
        };
        entry.outbound.try_send(envelope).map_err(|_| {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            SendError::Saturated(id)
        })
    }

    fn deliver(&self, id: Uuid, outbound: &mpsc::Sender<Envelope>, envelope: Envelope) -> bool {
        match outbound.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Saturated peer: drop the frame, never block the fan-out.
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!(connection = %id, "outbound buffer full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = %id, "outbound channel closed");
                false
            }
        }
    }

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events_tx.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Frames dropped because a peer's buffer was saturated.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// GET /ws - WebSocket upgrade into the broker connection loop.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<StreamBroker>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, broker))
}

/// Create the broker's WebSocket router.
pub fn create_broker_router(broker: Arc<StreamBroker>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(broker)
}
