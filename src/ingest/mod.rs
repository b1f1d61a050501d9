use crate::broker::StreamBroker;
use crate::ledger::{ErrorKind, ErrorLedger};
use crate::record::{
    now_ms, validate_batch, validate_emergency, validate_intersection, validate_metrics,
    validate_road, validate_vehicle, BatchValidation, Category, EmergencyVehicleRecord,
    MetricsSnapshot, NormalizeError, Normalizer, RawTick, RoadSegmentRecord, Validation,
    VehicleRecord,
};
use axum::{extract::State, response::Json, routing::post, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
mod tests;

/// Per-category outcome of one tick.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CategoryReport {
    pub accepted: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickReport {
    pub vehicles: CategoryReport,
    pub intersections: CategoryReport,
    pub roads: CategoryReport,
    pub emergency_vehicles: CategoryReport,
}

/// Raw tick → normalize → validate → fan out.
///
/// A malformed entry never poisons its batch: structural normalization
/// failures and validation rejects are recorded in the ledger and the rest
/// of the batch flows through. Each surviving batch replaces the previous
/// one for its category downstream.
pub struct TickPipeline {
    normalizer: Normalizer,
    broker: Arc<StreamBroker>,
    ledger: Arc<ErrorLedger>,
}

impl TickPipeline {
    pub fn new(normalizer: Normalizer, broker: Arc<StreamBroker>, ledger: Arc<ErrorLedger>) -> Self {
        Self {
            normalizer,
            broker,
            ledger,
        }
    }

    /// Process one raw tick: broadcast every included category to its
    /// subscribers and derive an aggregate metrics snapshot for everyone.
    pub fn process(&self, tick: &RawTick) -> TickReport {
        let mut report = TickReport::default();

        let vehicles = tick.vehicles.as_deref().map(|raw| {
            let normalized = self.normalize_each(raw, &mut report.vehicles, |r| {
                self.normalizer.vehicle(r)
            });
            self.finish_batch(
                Category::Vehicles,
                normalized,
                validate_vehicle,
                &mut report.vehicles,
            )
        });

        let emergency = tick.emergency_vehicles.as_deref().map(|raw| {
            let normalized = self.normalize_each(raw, &mut report.emergency_vehicles, |r| {
                self.normalizer.emergency_vehicle(r)
            });
            self.finish_batch(
                Category::EmergencyVehicles,
                normalized,
                validate_emergency,
                &mut report.emergency_vehicles,
            )
        });

        if let Some(raw) = tick.intersections.as_deref() {
            let normalized = self.normalize_each(raw, &mut report.intersections, |r| {
                self.normalizer.intersection(r)
            });
            self.finish_batch(
                Category::Intersections,
                normalized,
                validate_intersection,
                &mut report.intersections,
            );
        }

        let roads = tick.roads.as_deref().map(|raw| {
            let normalized =
                self.normalize_each(raw, &mut report.roads, |r| self.normalizer.road(r));
            self.finish_batch(Category::Roads, normalized, validate_road, &mut report.roads)
        });

        self.publish_metrics(
            vehicles.as_deref().unwrap_or_default(),
            emergency.as_deref().unwrap_or_default(),
            roads.as_deref().unwrap_or_default(),
            tick.timestamp,
        );

        report
    }

    fn normalize_each<R, T>(
        &self,
        raw: &[R],
        report: &mut CategoryReport,
        normalize: impl Fn(&R) -> Result<T, NormalizeError>,
    ) -> Vec<T>
    where
        R: Serialize,
    {
        let mut records = Vec::with_capacity(raw.len());
        for entry in raw {
            match normalize(entry) {
                Ok(record) => records.push(record),
                Err(e) => {
                    report.dropped += 1;
                    self.ledger.record(
                        ErrorKind::Processing,
                        e.to_string(),
                        serde_json::to_value(entry).ok(),
                    );
                }
            }
        }
        records
    }

    fn finish_batch<T>(
        &self,
        category: Category,
        records: Vec<T>,
        validate: impl Fn(T) -> Validation<T>,
        report: &mut CategoryReport,
    ) -> Vec<T>
    where
        T: Serialize,
    {
        let batch: BatchValidation<T> = validate_batch(records, |record| {
            let outcome = validate(record);
            if let Some(warnings) = &outcome.warnings {
                debug!(category = %category, warnings = ?warnings, "record flagged");
            }
            outcome
        });
        for rejected in &batch.invalid {
            report.dropped += 1;
            self.ledger.record(
                ErrorKind::Validation,
                format!(
                    "{} entry {} rejected: {}",
                    category,
                    rejected.index,
                    rejected.errors.join("; ")
                ),
                None,
            );
        }
        report.accepted = batch.valid.len();

        match serde_json::to_value(&batch.valid) {
            Ok(data) => {
                self.broker.broadcast(category, data);
            }
            Err(e) => {
                self.ledger
                    .record(ErrorKind::Processing, format!("serialize batch: {}", e), None);
            }
        }
        batch.valid
    }

    fn publish_metrics(
        &self,
        vehicles: &[VehicleRecord],
        emergency: &[EmergencyVehicleRecord],
        roads: &[RoadSegmentRecord],
        timestamp: Option<i64>,
    ) {
        let snapshot = aggregate_metrics(vehicles, emergency, roads, timestamp);
        let outcome = validate_metrics(snapshot);
        if let Some(warnings) = &outcome.warnings {
            debug!(warnings = ?warnings, "metrics flagged");
        }
        if outcome.is_valid {
            self.broker.broadcast_metrics(&outcome.data);
        } else {
            self.ledger.record(
                ErrorKind::Processing,
                format!("metrics rejected: {}", outcome.errors.join("; ")),
                None,
            );
        }
    }
}

/// Network-wide aggregates for one tick. The congestion index is the share
/// of congested road segments, so it stays within [0, 1] by construction.
pub fn aggregate_metrics(
    vehicles: &[VehicleRecord],
    emergency: &[EmergencyVehicleRecord],
    roads: &[RoadSegmentRecord],
    timestamp: Option<i64>,
) -> MetricsSnapshot {
    let all_vehicles = || {
        vehicles
            .iter()
            .chain(emergency.iter().map(|e| &e.vehicle))
    };
    let vehicle_count = vehicles.len() + emergency.len();

    let average_speed = mean(all_vehicles().map(|v| v.speed));
    let average_waiting_time = mean(all_vehicles().filter_map(|v| v.waiting_time));
    // Elapsed travel time so far: distance over current speed, where both
    // are known and the vehicle is moving
    let average_travel_time = mean(all_vehicles().filter_map(|v| {
        let distance = v.distance?;
        let speed_ms = v.speed / 3.6;
        (speed_ms > 0.0).then(|| distance / speed_ms)
    }));
    let total_emissions = all_vehicles().filter_map(|v| v.emissions).sum();
    let throughput = roads
        .iter()
        .flat_map(|r| r.lanes.iter())
        .map(|l| l.flow)
        .sum();

    let congested = roads
        .iter()
        .filter(|r| {
            matches!(
                r.congestion_level,
                crate::record::CongestionLevel::High | crate::record::CongestionLevel::Critical
            )
        })
        .count();
    let congestion_index = if roads.is_empty() {
        0.0
    } else {
        congested as f64 / roads.len() as f64
    };

    MetricsSnapshot {
        vehicle_count,
        average_speed,
        average_waiting_time,
        average_travel_time,
        total_emissions,
        throughput,
        congestion_index,
        timestamp: timestamp.unwrap_or_else(now_ms),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// POST /api/tick - raw upstream tick ingestion.
async fn ingest_tick(
    State(pipeline): State<Arc<TickPipeline>>,
    Json(tick): Json<RawTick>,
) -> Json<Value> {
    let report = pipeline.process(&tick);
    info!(
        vehicles = report.vehicles.accepted,
        intersections = report.intersections.accepted,
        roads = report.roads.accepted,
        emergency = report.emergency_vehicles.accepted,
        "tick processed"
    );
    Json(json!({ "status": "accepted", "report": report }))
}

/// Create the ingestion router.
pub fn create_ingest_router(pipeline: Arc<TickPipeline>) -> Router {
    Router::new()
        .route("/api/tick", post(ingest_tick))
        .with_state(pipeline)
}
