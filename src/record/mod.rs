use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

mod normalize;
mod validate;

pub use normalize::{
    congestion_from_occupancy, congestion_from_queue, phase_from, priority_from, vehicle_kind_from,
    NormalizeError, Normalizer, RawDestination, RawIntersection, RawLane, RawRoad, RawTick,
    RawTrafficLight, RawVehicle,
};
pub use validate::{
    validate_batch, validate_emergency, validate_intersection, validate_metrics, validate_road,
    validate_vehicle, BatchError, BatchValidation, Validation,
};

/// Subscription category: the unit of fan-out granularity.
///
/// Wire names are fixed for interoperability with existing viewers:
/// `vehicles`, `intersections`, `roads`, `emergency-vehicles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Vehicles,
    Intersections,
    Roads,
    EmergencyVehicles,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Vehicles,
        Category::Intersections,
        Category::Roads,
        Category::EmergencyVehicles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Vehicles => "vehicles",
            Category::Intersections => "intersections",
            Category::Roads => "roads",
            Category::EmergencyVehicles => "emergency-vehicles",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic position. `road_id`/`lane_id` locate the vehicle on the network
/// when the upstream source reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub road_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lane_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleKind {
    Car,
    Bus,
    Truck,
    Motorcycle,
    Bicycle,
    Emergency,
}

/// One vehicle at one tick. Reconstructed wholesale every batch, never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: VehicleKind,
    pub position: Position,
    /// km/h
    pub speed: f64,
    /// m/s²
    pub acceleration: f64,
    /// Heading in degrees.
    pub angle: f64,
    /// Ordered road ids the vehicle will traverse.
    pub route: Vec<String>,
    /// Epoch milliseconds of the producing tick.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emissions: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyKind {
    Ambulance,
    Police,
    Fire,
    Rescue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmergencyStatus {
    Responding,
    OnScene,
    Returning,
    Available,
    OutOfService,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A vehicle with an active emergency role. Serialized flat (vehicle fields
/// plus the emergency extras) to match the wire shape viewers expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyVehicleRecord {
    #[serde(flatten)]
    pub vehicle: VehicleRecord,
    pub emergency_type: EmergencyKind,
    pub priority: EmergencyPriority,
    pub status: EmergencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    /// Seconds to destination, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    /// Intersections asked to grant signal priority.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signal_priority_requests: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LightPhase {
    Red,
    Yellow,
    Green,
    RedYellow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficLightState {
    pub phase: LightPhase,
    pub direction: String,
    /// Seconds until the phase changes.
    pub remaining_time: f64,
    pub next_phase: LightPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntersectionRecord {
    pub id: String,
    pub position: Position,
    pub traffic_lights: Vec<TrafficLightState>,
    /// Halting vehicles per approach lane.
    pub queue_lengths: HashMap<String, u32>,
    /// Accumulated waiting seconds per approach lane.
    pub waiting_times: HashMap<String, f64>,
    pub congestion_level: CongestionLevel,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStats {
    pub id: String,
    pub vehicle_count: u32,
    /// km/h
    pub average_speed: f64,
    /// vehicles per km
    pub density: f64,
    /// vehicles per hour
    pub flow: f64,
    /// Percent of lane length occupied, 0–100.
    pub occupancy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadSegmentRecord {
    pub id: String,
    /// Polyline as [lat, lng] pairs.
    pub coordinates: Vec<[f64; 2]>,
    pub lanes: Vec<LaneStats>,
    pub congestion_level: CongestionLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incidents: Vec<Incident>,
    pub timestamp: i64,
}

/// Aggregate view across the whole network at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub vehicle_count: usize,
    /// km/h
    pub average_speed: f64,
    /// Seconds
    pub average_waiting_time: f64,
    /// Seconds
    pub average_travel_time: f64,
    pub total_emissions: f64,
    /// Vehicles per hour across monitored lanes.
    pub throughput: f64,
    /// 0.0 (free-flowing) to 1.0 (gridlock).
    pub congestion_index: f64,
    pub timestamp: i64,
}

/// Current epoch milliseconds, the timestamp unit used on the wire.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch-millisecond timestamp as a chrono time, for age checks.
pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
