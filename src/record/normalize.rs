use super::{
    CongestionLevel, Destination, EmergencyKind, EmergencyPriority, EmergencyStatus,
    IntersectionRecord, LaneStats, LightPhase, Position, RoadSegmentRecord, TrafficLightState,
    VehicleKind, VehicleRecord,
};
use crate::config::GeoConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Structural failures that make a raw record unusable. Each failure is
/// scoped to one record; the enclosing batch continues without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    MissingId,
    MissingCoordinates,
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::MissingId => write!(f, "record has no identifying id"),
            NormalizeError::MissingCoordinates => {
                write!(f, "record has no usable coordinate source")
            }
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Raw upstream vehicle as the simulation source reports it: loosely typed,
/// every field optional. Deliberately mapped field-by-field into the strict
/// domain record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawVehicle {
    pub id: Option<String>,
    /// Upstream vehicle-class string, e.g. "passenger" or "ambulance".
    #[serde(rename = "type")]
    pub class: Option<String>,
    /// Planar network coordinates (meters).
    pub x: Option<f64>,
    pub y: Option<f64>,
    /// Pre-projected geographic coordinates, when the source provides them.
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub road_id: Option<String>,
    pub lane_id: Option<String>,
    /// m/s
    pub speed: Option<f64>,
    pub acceleration: Option<f64>,
    pub angle: Option<f64>,
    pub route: Option<Vec<String>>,
    pub waiting_time: Option<f64>,
    pub distance: Option<f64>,
    pub emissions: Option<f64>,
    pub timestamp: Option<i64>,
    pub emergency_type: Option<String>,
    /// Numeric (0–10) or string priority; both forms occur upstream.
    pub priority: Option<Value>,
    pub status: Option<String>,
    pub destination: Option<RawDestination>,
    pub eta: Option<f64>,
    pub signal_priority_requests: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDestination {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTrafficLight {
    pub phase: Option<String>,
    pub direction: Option<String>,
    pub remaining_time: Option<f64>,
    pub next_phase: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawIntersection {
    pub id: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub traffic_lights: Option<Vec<RawTrafficLight>>,
    pub queue_lengths: Option<HashMap<String, u32>>,
    pub waiting_times: Option<HashMap<String, f64>>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawLane {
    pub id: Option<String>,
    pub vehicle_count: Option<u32>,
    /// m/s
    pub average_speed: Option<f64>,
    /// Meters; used to derive density when the source omits it.
    pub length: Option<f64>,
    pub density: Option<f64>,
    pub flow: Option<f64>,
    pub occupancy: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawRoad {
    pub id: Option<String>,
    /// Pre-projected [lat, lng] polyline.
    pub coordinates: Option<Vec<[f64; 2]>>,
    /// Planar polyline, projected through the geo transform when present.
    pub shape: Option<Vec<[f64; 2]>>,
    pub lanes: Option<Vec<RawLane>>,
    pub timestamp: Option<i64>,
}

/// One full tick of raw upstream data; any category may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTick {
    pub vehicles: Option<Vec<RawVehicle>>,
    pub intersections: Option<Vec<RawIntersection>>,
    pub roads: Option<Vec<RawRoad>>,
    pub emergency_vehicles: Option<Vec<RawVehicle>>,
    pub timestamp: Option<i64>,
}

/// Maps an upstream vehicle-class string to the domain kind.
/// Case-insensitive; unknown classes fall back to Car. Emergency
/// sub-classes all collapse into the Emergency kind.
pub fn vehicle_kind_from(class: &str) -> VehicleKind {
    match class.to_ascii_lowercase().as_str() {
        "bus" => VehicleKind::Bus,
        "truck" => VehicleKind::Truck,
        "motorcycle" => VehicleKind::Motorcycle,
        "bicycle" => VehicleKind::Bicycle,
        "emergency" | "ambulance" | "police" | "fire" | "rescue" => VehicleKind::Emergency,
        _ => VehicleKind::Car,
    }
}

/// Maps a raw priority (numeric 0–10 or string) to the domain priority.
/// Missing or unrecognized values default to Medium.
pub fn priority_from(raw: Option<&Value>) -> EmergencyPriority {
    match raw {
        Some(Value::Number(n)) => {
            let p = n.as_f64().unwrap_or(0.0);
            if p >= 8.0 {
                EmergencyPriority::Critical
            } else if p >= 6.0 {
                EmergencyPriority::High
            } else if p >= 4.0 {
                EmergencyPriority::Medium
            } else {
                EmergencyPriority::Low
            }
        }
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "low" => EmergencyPriority::Low,
            "high" => EmergencyPriority::High,
            "critical" => EmergencyPriority::Critical,
            _ => EmergencyPriority::Medium,
        },
        _ => EmergencyPriority::Medium,
    }
}

/// Congestion from the longest approach queue.
pub fn congestion_from_queue(max_queue: u32) -> CongestionLevel {
    if max_queue > 50 {
        CongestionLevel::Critical
    } else if max_queue > 25 {
        CongestionLevel::High
    } else if max_queue > 10 {
        CongestionLevel::Medium
    } else {
        CongestionLevel::Low
    }
}

/// Congestion from the highest lane occupancy percentage.
pub fn congestion_from_occupancy(occupancy: f64) -> CongestionLevel {
    if occupancy > 80.0 {
        CongestionLevel::Critical
    } else if occupancy > 60.0 {
        CongestionLevel::High
    } else if occupancy > 30.0 {
        CongestionLevel::Medium
    } else {
        CongestionLevel::Low
    }
}

/// First character of the upstream phase string decides the phase; anything
/// unrecognized is treated as red (fail-safe).
pub fn phase_from(raw: &str) -> LightPhase {
    match raw.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('r') => LightPhase::Red,
        Some('y') => LightPhase::Yellow,
        Some('g') => LightPhase::Green,
        _ => LightPhase::Red,
    }
}

const MS_TO_KMH: f64 = 3.6;

/// Converts raw upstream records into typed domain records.
///
/// The geographic transform is externally configured: the upstream planar
/// (x, y) grid maps onto (lat, lng) through one affine projection anchored
/// at a base point.
pub struct Normalizer {
    geo: GeoConfig,
}

impl Normalizer {
    pub fn new(geo: GeoConfig) -> Self {
        Self { geo }
    }

    /// Affine planar-to-geographic projection.
    pub fn project(&self, x: f64, y: f64) -> (f64, f64) {
        let lat = self.geo.base_lat + (y - self.geo.base_y) * self.geo.scale;
        let lng = self.geo.base_lng + (x - self.geo.base_x) * self.geo.scale;
        (lat, lng)
    }

    fn position(
        &self,
        lat: Option<f64>,
        lng: Option<f64>,
        x: Option<f64>,
        y: Option<f64>,
        road_id: Option<String>,
        lane_id: Option<String>,
    ) -> Result<Position, NormalizeError> {
        let (lat, lng) = match (lat, lng) {
            (Some(lat), Some(lng)) => (lat, lng),
            _ => match (x, y) {
                (Some(x), Some(y)) => self.project(x, y),
                _ => return Err(NormalizeError::MissingCoordinates),
            },
        };
        Ok(Position {
            lat,
            lng,
            road_id,
            lane_id,
        })
    }

    pub fn vehicle(&self, raw: &RawVehicle) -> Result<VehicleRecord, NormalizeError> {
        let id = match raw.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(NormalizeError::MissingId),
        };
        let position = self.position(
            raw.lat,
            raw.lng,
            raw.x,
            raw.y,
            raw.road_id.clone(),
            raw.lane_id.clone(),
        )?;
        Ok(VehicleRecord {
            id,
            kind: vehicle_kind_from(raw.class.as_deref().unwrap_or("")),
            position,
            speed: raw.speed.unwrap_or(0.0) * MS_TO_KMH,
            acceleration: raw.acceleration.unwrap_or(0.0),
            angle: raw.angle.unwrap_or(0.0),
            route: raw.route.clone().unwrap_or_default(),
            timestamp: raw.timestamp.unwrap_or_else(super::now_ms),
            waiting_time: raw.waiting_time,
            distance: raw.distance,
            emissions: raw.emissions,
        })
    }

    pub fn emergency_vehicle(
        &self,
        raw: &RawVehicle,
    ) -> Result<super::EmergencyVehicleRecord, NormalizeError> {
        let mut vehicle = self.vehicle(raw)?;
        vehicle.kind = VehicleKind::Emergency;
        let destination = raw.destination.as_ref().and_then(|d| {
            Some(Destination {
                lat: d.lat?,
                lng: d.lng?,
                description: d.description.clone(),
            })
        });
        Ok(super::EmergencyVehicleRecord {
            vehicle,
            emergency_type: emergency_kind_from(raw.emergency_type.as_deref().unwrap_or("")),
            priority: priority_from(raw.priority.as_ref()),
            status: emergency_status_from(raw.status.as_deref().unwrap_or("")),
            destination,
            eta: raw.eta,
            signal_priority_requests: raw.signal_priority_requests.clone().unwrap_or_default(),
        })
    }

    pub fn intersection(
        &self,
        raw: &RawIntersection,
    ) -> Result<IntersectionRecord, NormalizeError> {
        let id = match raw.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(NormalizeError::MissingId),
        };
        let position = self.position(raw.lat, raw.lng, raw.x, raw.y, None, None)?;
        let traffic_lights = raw
            .traffic_lights
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|l| TrafficLightState {
                phase: phase_from(l.phase.as_deref().unwrap_or("")),
                direction: l.direction.clone().unwrap_or_else(|| "all".to_string()),
                remaining_time: l.remaining_time.unwrap_or(0.0).max(0.0),
                next_phase: phase_from(l.next_phase.as_deref().unwrap_or("")),
            })
            .collect();
        let queue_lengths = raw.queue_lengths.clone().unwrap_or_default();
        let max_queue = queue_lengths.values().copied().max().unwrap_or(0);
        Ok(IntersectionRecord {
            id,
            position,
            traffic_lights,
            congestion_level: congestion_from_queue(max_queue),
            queue_lengths,
            waiting_times: raw.waiting_times.clone().unwrap_or_default(),
            timestamp: raw.timestamp.unwrap_or_else(super::now_ms),
        })
    }

    pub fn road(&self, raw: &RawRoad) -> Result<RoadSegmentRecord, NormalizeError> {
        let id = match raw.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(NormalizeError::MissingId),
        };
        let coordinates: Vec<[f64; 2]> = match (&raw.coordinates, &raw.shape) {
            (Some(coords), _) if !coords.is_empty() => coords.clone(),
            (_, Some(shape)) if !shape.is_empty() => shape
                .iter()
                .map(|[x, y]| {
                    let (lat, lng) = self.project(*x, *y);
                    [lat, lng]
                })
                .collect(),
            _ => return Err(NormalizeError::MissingCoordinates),
        };
        let lanes: Vec<LaneStats> = raw
            .lanes
            .as_deref()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, l)| normalize_lane(&id, i, l))
            .collect();
        let max_occupancy = lanes.iter().map(|l| l.occupancy).fold(0.0, f64::max);
        Ok(RoadSegmentRecord {
            id,
            coordinates,
            congestion_level: congestion_from_occupancy(max_occupancy),
            lanes,
            incidents: Vec::new(),
            timestamp: raw.timestamp.unwrap_or_else(super::now_ms),
        })
    }
}

fn normalize_lane(road_id: &str, index: usize, raw: &RawLane) -> LaneStats {
    let vehicle_count = raw.vehicle_count.unwrap_or(0);
    // Density falls back to count over lane length when the source omits it.
    let density = raw.density.unwrap_or_else(|| match raw.length {
        Some(len) if len > 0.0 => vehicle_count as f64 / (len / 1000.0),
        _ => 0.0,
    });
    LaneStats {
        id: raw
            .id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", road_id, index)),
        vehicle_count,
        average_speed: raw.average_speed.unwrap_or(0.0) * MS_TO_KMH,
        density,
        flow: raw.flow.unwrap_or(0.0),
        occupancy: raw.occupancy.unwrap_or(0.0),
    }
}

fn emergency_kind_from(raw: &str) -> EmergencyKind {
    match raw.to_ascii_lowercase().as_str() {
        "ambulance" => EmergencyKind::Ambulance,
        "police" => EmergencyKind::Police,
        "fire" => EmergencyKind::Fire,
        _ => EmergencyKind::Rescue,
    }
}

fn emergency_status_from(raw: &str) -> EmergencyStatus {
    match raw.to_ascii_lowercase().as_str() {
        "on-scene" | "on_scene" => EmergencyStatus::OnScene,
        "returning" => EmergencyStatus::Returning,
        "available" => EmergencyStatus::Available,
        "out-of-service" | "out_of_service" => EmergencyStatus::OutOfService,
        _ => EmergencyStatus::Responding,
    }
}
