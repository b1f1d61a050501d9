use super::*;
use crate::config::{BrokerConfig, GeoConfig};
use crate::record::{RawIntersection, RawVehicle};
use tokio::sync::mpsc;

fn make_pipeline() -> (TickPipeline, Arc<StreamBroker>, Arc<ErrorLedger>) {
    let ledger = Arc::new(ErrorLedger::default());
    let broker = Arc::new(StreamBroker::new(BrokerConfig::default(), Arc::clone(&ledger)));
    let pipeline = TickPipeline::new(
        Normalizer::new(GeoConfig::default()),
        Arc::clone(&broker),
        Arc::clone(&ledger),
    );
    (pipeline, broker, ledger)
}

fn raw_vehicle(id: &str) -> RawVehicle {
    RawVehicle {
        id: Some(id.to_string()),
        class: Some("passenger".to_string()),
        x: Some(100.0),
        y: Some(100.0),
        speed: Some(8.0),
        timestamp: Some(now_ms()),
        ..Default::default()
    }
}

#[tokio::test]
async fn malformed_entries_shrink_the_batch_by_exactly_their_count() {
    let (pipeline, broker, ledger) = make_pipeline();
    let (tx, mut rx) = mpsc::channel(8);
    let id = broker.register(tx);
    rx.try_recv().unwrap(); // welcome
    broker.subscribe(id, Category::Vehicles);
    rx.try_recv().unwrap(); // confirmation

    let tick = RawTick {
        vehicles: Some(vec![
            raw_vehicle("veh_1"),
            RawVehicle::default(), // no id, no coordinates
            raw_vehicle("veh_3"),
        ]),
        ..Default::default()
    };
    let report = pipeline.process(&tick);

    assert_eq!(report.vehicles.accepted, 2);
    assert_eq!(report.vehicles.dropped, 1);

    let frame = rx.try_recv().unwrap();
    assert_eq!(frame.kind, "vehicles");
    assert_eq!(frame.data.unwrap().as_array().unwrap().len(), 2);

    let processing = ledger.by_kind(ErrorKind::Processing, None);
    assert_eq!(processing.len(), 1);
    // The offending raw payload rides along as context
    assert!(processing[0].context.is_some());
}

#[tokio::test]
async fn validation_rejects_are_dropped_and_recorded() {
    let (pipeline, _broker, ledger) = make_pipeline();

    let mut unvalidatable = raw_vehicle("veh_nan");
    unvalidatable.speed = Some(f64::NAN);

    let tick = RawTick {
        vehicles: Some(vec![raw_vehicle("veh_1"), unvalidatable]),
        ..Default::default()
    };
    let report = pipeline.process(&tick);

    assert_eq!(report.vehicles.accepted, 1);
    assert_eq!(report.vehicles.dropped, 1);
    let rejects = ledger.by_kind(ErrorKind::Validation, None);
    assert_eq!(rejects.len(), 1);
    assert!(rejects[0].message.contains("entry 1"));
}

#[tokio::test]
async fn absent_categories_are_not_broadcast() {
    let (pipeline, broker, _ledger) = make_pipeline();
    let (tx, mut rx) = mpsc::channel(8);
    let id = broker.register(tx);
    rx.try_recv().unwrap();
    broker.subscribe(id, Category::Intersections);
    rx.try_recv().unwrap();

    let tick = RawTick {
        vehicles: Some(vec![raw_vehicle("veh_1")]),
        ..Default::default()
    };
    pipeline.process(&tick);

    // Only the metrics snapshot arrives; no intersections batch was included
    let frame = rx.try_recv().unwrap();
    assert_eq!(frame.kind, "traffic-metrics");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn tick_reaches_only_matching_subscribers_with_metrics_for_all() {
    let (pipeline, broker, _ledger) = make_pipeline();

    let (tx, mut vehicles_rx) = mpsc::channel(8);
    let vehicles_conn = broker.register(tx);
    let (tx, mut intersections_rx) = mpsc::channel(8);
    let intersections_conn = broker.register(tx);
    vehicles_rx.try_recv().unwrap();
    intersections_rx.try_recv().unwrap();
    broker.subscribe(vehicles_conn, Category::Vehicles);
    broker.subscribe(intersections_conn, Category::Intersections);
    vehicles_rx.try_recv().unwrap();
    intersections_rx.try_recv().unwrap();

    let tick = RawTick {
        vehicles: Some(vec![raw_vehicle("veh_1")]),
        intersections: Some(vec![RawIntersection {
            id: Some("tls_1".to_string()),
            x: Some(0.0),
            y: Some(0.0),
            timestamp: Some(now_ms()),
            ..Default::default()
        }]),
        ..Default::default()
    };
    pipeline.process(&tick);

    assert_eq!(vehicles_rx.try_recv().unwrap().kind, "vehicles");
    assert_eq!(vehicles_rx.try_recv().unwrap().kind, "traffic-metrics");
    assert_eq!(intersections_rx.try_recv().unwrap().kind, "intersections");
    assert_eq!(intersections_rx.try_recv().unwrap().kind, "traffic-metrics");
}

#[test]
fn aggregates_cover_a_mixed_batch() {
    let normalizer = Normalizer::new(GeoConfig::default());
    let vehicles: Vec<VehicleRecord> = vec![
        {
            let mut v = normalizer.vehicle(&raw_vehicle("veh_1")).unwrap();
            v.speed = 30.0;
            v.waiting_time = Some(10.0);
            v.emissions = Some(2.0);
            v
        },
        {
            let mut v = normalizer.vehicle(&raw_vehicle("veh_2")).unwrap();
            v.speed = 50.0;
            v.waiting_time = Some(20.0);
            v.emissions = Some(3.0);
            v
        },
    ];
    let roads = vec![
        RoadSegmentRecord {
            id: "edge_1".to_string(),
            coordinates: vec![[9.0, 38.7], [9.1, 38.8]],
            lanes: vec![crate::record::LaneStats {
                id: "edge_1_0".to_string(),
                vehicle_count: 5,
                average_speed: 40.0,
                density: 10.0,
                flow: 600.0,
                occupancy: 20.0,
            }],
            congestion_level: crate::record::CongestionLevel::Low,
            incidents: Vec::new(),
            timestamp: now_ms(),
        },
        RoadSegmentRecord {
            id: "edge_2".to_string(),
            coordinates: vec![[9.0, 38.7], [9.1, 38.8]],
            lanes: vec![crate::record::LaneStats {
                id: "edge_2_0".to_string(),
                vehicle_count: 40,
                average_speed: 6.0,
                density: 80.0,
                flow: 240.0,
                occupancy: 85.0,
            }],
            congestion_level: crate::record::CongestionLevel::Critical,
            incidents: Vec::new(),
            timestamp: now_ms(),
        },
    ];

    let snapshot = aggregate_metrics(&vehicles, &[], &roads, Some(1_700_000_000_000));

    assert_eq!(snapshot.vehicle_count, 2);
    assert!((snapshot.average_speed - 40.0).abs() < 1e-9);
    assert!((snapshot.average_waiting_time - 15.0).abs() < 1e-9);
    assert!((snapshot.total_emissions - 5.0).abs() < 1e-9);
    assert!((snapshot.throughput - 840.0).abs() < 1e-9);
    // One of two segments congested
    assert!((snapshot.congestion_index - 0.5).abs() < 1e-9);
    assert_eq!(snapshot.timestamp, 1_700_000_000_000);
}

#[test]
fn aggregates_for_an_empty_tick_are_zero() {
    let snapshot = aggregate_metrics(&[], &[], &[], None);
    assert_eq!(snapshot.vehicle_count, 0);
    assert_eq!(snapshot.average_speed, 0.0);
    assert_eq!(snapshot.congestion_index, 0.0);
}
