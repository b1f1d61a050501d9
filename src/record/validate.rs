use super::{
    ms_to_datetime, EmergencyStatus, EmergencyVehicleRecord, IntersectionRecord, MetricsSnapshot,
    RoadSegmentRecord, VehicleRecord,
};
use chrono::{Duration, Utc};

/// Outcome of validating one record.
///
/// Structural errors are authoritative for `is_valid`; semantic anomalies
/// only populate `warnings` and never reject the record. `warnings` stays
/// `None` when the record is unremarkable.
#[derive(Debug, Clone)]
pub struct Validation<T> {
    pub is_valid: bool,
    pub data: T,
    pub errors: Vec<String>,
    pub warnings: Option<Vec<String>>,
}

impl<T> Validation<T> {
    fn from_checks(data: T, errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            data,
            errors,
            warnings: if warnings.is_empty() {
                None
            } else {
                Some(warnings)
            },
        }
    }
}

const STALE_AFTER_MINUTES: i64 = 5;

fn common_checks(
    id: &str,
    lat: f64,
    lng: f64,
    timestamp: i64,
    errors: &mut Vec<String>,
) {
    if id.is_empty() {
        errors.push("id is required".to_string());
    }
    if !lat.is_finite() || !lng.is_finite() {
        errors.push("position coordinates must be finite".to_string());
    }
    if timestamp <= 0 {
        errors.push(format!("timestamp must be positive, got {}", timestamp));
    }
}

fn freshness_and_bounds(lat: f64, lng: f64, timestamp: i64, warnings: &mut Vec<String>) {
    if let Some(ts) = ms_to_datetime(timestamp) {
        if Utc::now() - ts > Duration::minutes(STALE_AFTER_MINUTES) {
            warnings.push("stale data".to_string());
        }
    }
    if lat.abs() > 90.0 || lng.abs() > 180.0 {
        warnings.push("coordinates may be invalid".to_string());
    }
}

fn vehicle_structural(vehicle: &VehicleRecord, errors: &mut Vec<String>) {
    common_checks(
        &vehicle.id,
        vehicle.position.lat,
        vehicle.position.lng,
        vehicle.timestamp,
        errors,
    );
    if !vehicle.speed.is_finite() || vehicle.speed < 0.0 {
        errors.push(format!("speed must be non-negative, got {}", vehicle.speed));
    }
}

fn vehicle_semantic(vehicle: &VehicleRecord, warnings: &mut Vec<String>) {
    if vehicle.speed > 200.0 {
        warnings.push("unusually high speed".to_string());
    }
    freshness_and_bounds(
        vehicle.position.lat,
        vehicle.position.lng,
        vehicle.timestamp,
        warnings,
    );
    if vehicle.acceleration < -5.0 {
        warnings.push("high deceleration".to_string());
    }
}

pub fn validate_vehicle(vehicle: VehicleRecord) -> Validation<VehicleRecord> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    vehicle_structural(&vehicle, &mut errors);
    if errors.is_empty() {
        vehicle_semantic(&vehicle, &mut warnings);
    }

    Validation::from_checks(vehicle, errors, warnings)
}

pub fn validate_emergency(record: EmergencyVehicleRecord) -> Validation<EmergencyVehicleRecord> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    vehicle_structural(&record.vehicle, &mut errors);
    if errors.is_empty() {
        vehicle_semantic(&record.vehicle, &mut warnings);
        if record.status == EmergencyStatus::Responding {
            if record.vehicle.speed < 20.0 {
                warnings.push("responding emergency vehicle moving slowly".to_string());
            }
            if record.destination.is_none() {
                warnings.push("responding emergency vehicle has no destination".to_string());
            }
        }
        if record.eta.map_or(false, |eta| eta > 3600.0) {
            warnings.push("very long ETA".to_string());
        }
    }

    Validation::from_checks(record, errors, warnings)
}

pub fn validate_intersection(record: IntersectionRecord) -> Validation<IntersectionRecord> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    common_checks(
        &record.id,
        record.position.lat,
        record.position.lng,
        record.timestamp,
        &mut errors,
    );

    if errors.is_empty() {
        freshness_and_bounds(
            record.position.lat,
            record.position.lng,
            record.timestamp,
            &mut warnings,
        );
        let max_queue = record.queue_lengths.values().copied().max().unwrap_or(0);
        if max_queue > 100 {
            warnings.push("very long queue".to_string());
        }
        let max_wait = record
            .waiting_times
            .values()
            .copied()
            .fold(0.0, f64::max);
        if max_wait > 300.0 {
            warnings.push("very long waiting time".to_string());
        }
        if record.traffic_lights.is_empty() {
            warnings.push("no traffic light data".to_string());
        }
    }

    Validation::from_checks(record, errors, warnings)
}

pub fn validate_road(record: RoadSegmentRecord) -> Validation<RoadSegmentRecord> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if record.id.is_empty() {
        errors.push("id is required".to_string());
    }
    if record.coordinates.is_empty() {
        errors.push("coordinates are required".to_string());
    }
    if record.timestamp <= 0 {
        errors.push(format!(
            "timestamp must be positive, got {}",
            record.timestamp
        ));
    }

    if errors.is_empty() {
        if record.lanes.is_empty() {
            warnings.push("no lane data".to_string());
        }
        let total_vehicles: u32 = record.lanes.iter().map(|l| l.vehicle_count).sum();
        if total_vehicles > 1000 {
            warnings.push("very high vehicle count".to_string());
        }
        if !record.lanes.is_empty() && total_vehicles > 0 {
            let avg_speed: f64 = record.lanes.iter().map(|l| l.average_speed).sum::<f64>()
                / record.lanes.len() as f64;
            if avg_speed < 5.0 {
                warnings.push("severe congestion".to_string());
            }
        }
    }

    Validation::from_checks(record, errors, warnings)
}

pub fn validate_metrics(snapshot: MetricsSnapshot) -> Validation<MetricsSnapshot> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !(0.0..=1.0).contains(&snapshot.congestion_index) {
        errors.push(format!(
            "congestion index must be within [0, 1], got {}",
            snapshot.congestion_index
        ));
    }
    if snapshot.timestamp <= 0 {
        errors.push(format!(
            "timestamp must be positive, got {}",
            snapshot.timestamp
        ));
    }

    if errors.is_empty() {
        if snapshot.vehicle_count == 0
            && (snapshot.average_travel_time > 0.0 || snapshot.throughput > 0.0)
        {
            warnings.push("zero vehicles with nonzero aggregate totals".to_string());
        }
        if snapshot.congestion_index > 0.9 {
            warnings.push("very high congestion index".to_string());
        }
    }

    Validation::from_checks(snapshot, errors, warnings)
}

/// One rejected batch entry, tagged with its position in the input array.
#[derive(Debug, Clone)]
pub struct BatchError {
    pub index: usize,
    pub errors: Vec<String>,
}

/// Result of validating a whole batch: valid entries survive in input order,
/// invalid entries are dropped and reported. The batch as a whole is valid
/// when at least one entry validates.
#[derive(Debug, Clone)]
pub struct BatchValidation<T> {
    pub valid: Vec<T>,
    pub invalid: Vec<BatchError>,
    pub is_valid: bool,
}

pub fn validate_batch<T, F>(items: Vec<T>, validate: F) -> BatchValidation<T>
where
    F: Fn(T) -> Validation<T>,
{
    let mut valid = Vec::with_capacity(items.len());
    let mut invalid = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        let outcome = validate(item);
        if outcome.is_valid {
            valid.push(outcome.data);
        } else {
            invalid.push(BatchError {
                index,
                errors: outcome.errors,
            });
        }
    }

    let is_valid = !valid.is_empty();
    BatchValidation {
        valid,
        invalid,
        is_valid,
    }
}
