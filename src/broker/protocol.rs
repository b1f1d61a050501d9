use crate::record::{now_ms, Category, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message-type names carried in the envelope `type` field. Fixed strings;
/// existing viewers match on them.
pub mod kind {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SIMULATION_UPDATE: &str = "simulation-update";
    pub const TRAFFIC_METRICS: &str = "traffic-metrics";
    pub const CONNECTION_ESTABLISHED: &str = "connection-established";
    pub const SUBSCRIPTION_CONFIRMED: &str = "subscription-confirmed";
    pub const UPSTREAM_STATUS: &str = "sumo-connection-status";
    pub const ERROR: &str = "error";
}

/// The single wire envelope used in both directions:
/// `{ type, dataType?, data?, timestamp? }`.
///
/// Data batches reuse the category name as the `type` (a `vehicles` message
/// carries an array of vehicle records, and so on). Timestamps are epoch
/// milliseconds and are set on every outbound message so the receiving side
/// can measure latency from any frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "dataType", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    fn stamped(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data_type: None,
            data: None,
            timestamp: Some(now_ms()),
        }
    }

    /// A full batch for one category; replaces the previous batch wholesale.
    pub fn batch(category: Category, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::stamped(category.as_str())
        }
    }

    /// Combined tick: optional per-category arrays applied atomically.
    pub fn simulation_update(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::stamped(kind::SIMULATION_UPDATE)
        }
    }

    pub fn metrics(snapshot: &MetricsSnapshot) -> Self {
        Self {
            data: serde_json::to_value(snapshot).ok(),
            ..Self::stamped(kind::TRAFFIC_METRICS)
        }
    }

    pub fn connection_established(capabilities: Value) -> Self {
        Self {
            data: Some(capabilities),
            ..Self::stamped(kind::CONNECTION_ESTABLISHED)
        }
    }

    pub fn subscription_confirmed(category: Category) -> Self {
        Self {
            data_type: Some(category),
            ..Self::stamped(kind::SUBSCRIPTION_CONFIRMED)
        }
    }

    pub fn upstream_status(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::stamped(kind::UPSTREAM_STATUS)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: Some(Value::String(message.into())),
            ..Self::stamped(kind::ERROR)
        }
    }

    pub fn subscribe(category: Category) -> Self {
        Self {
            data_type: Some(category),
            ..Self::stamped(kind::SUBSCRIBE)
        }
    }

    pub fn unsubscribe(category: Category) -> Self {
        Self {
            data_type: Some(category),
            ..Self::stamped(kind::UNSUBSCRIBE)
        }
    }

    pub fn ping() -> Self {
        Self::stamped(kind::PING)
    }

    pub fn pong() -> Self {
        Self::stamped(kind::PONG)
    }

    /// The category a data-bearing message belongs to, when the `type` field
    /// itself names one.
    pub fn category(&self) -> Option<Category> {
        match self.kind.as_str() {
            "vehicles" => Some(Category::Vehicles),
            "intersections" => Some(Category::Intersections),
            "roads" => Some(Category::Roads),
            "emergency-vehicles" => Some(Category::EmergencyVehicles),
            _ => None,
        }
    }
}

/// One tick's worth of already-serialized category batches, for the combined
/// `simulation-update` message. Only categories present in the tick are set.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicles: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intersections: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roads: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_vehicles: Option<Value>,
}

impl SimulationUpdate {
    fn get(&self, category: Category) -> Option<&Value> {
        match category {
            Category::Vehicles => self.vehicles.as_ref(),
            Category::Intersections => self.intersections.as_ref(),
            Category::Roads => self.roads.as_ref(),
            Category::EmergencyVehicles => self.emergency_vehicles.as_ref(),
        }
    }

    /// Wire field name per category within the update object.
    pub fn field_name(category: Category) -> &'static str {
        match category {
            Category::Vehicles => "vehicles",
            Category::Intersections => "intersections",
            Category::Roads => "roads",
            Category::EmergencyVehicles => "emergencyVehicles",
        }
    }

    /// The subset of this update a peer subscribed to, as the message `data`
    /// object. `None` when nothing matches.
    pub fn filtered(&self, subscriptions: &std::collections::HashSet<Category>) -> Option<Value> {
        let mut object = serde_json::Map::new();
        for category in Category::ALL {
            if !subscriptions.contains(&category) {
                continue;
            }
            if let Some(batch) = self.get(category) {
                object.insert(Self::field_name(category).to_string(), batch.clone());
            }
        }
        if object.is_empty() {
            None
        } else {
            Some(Value::Object(object))
        }
    }
}

/// Control messages a peer may send to the broker. Anything else inbound is
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe(Category),
    Unsubscribe(Category),
    Ping,
    Pong,
}

impl ClientRequest {
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        match envelope.kind.as_str() {
            kind::SUBSCRIBE => envelope.data_type.map(ClientRequest::Subscribe),
            kind::UNSUBSCRIBE => envelope.data_type.map(ClientRequest::Unsubscribe),
            kind::PING => Some(ClientRequest::Ping),
            kind::PONG => Some(ClientRequest::Pong),
            _ => None,
        }
    }
}
