use super::*;
use crate::config::BrokerConfig;
use crate::ledger::ErrorLedger;
use serde_json::json;

fn make_broker() -> Arc<StreamBroker> {
    Arc::new(StreamBroker::new(
        BrokerConfig::default(),
        Arc::new(ErrorLedger::default()),
    ))
}

fn attach(broker: &StreamBroker, buffer: usize) -> (Uuid, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(buffer);
    (broker.register(tx), rx)
}

#[tokio::test]
async fn register_sends_welcome() {
    let broker = make_broker();
    let (id, mut rx) = attach(&broker, 8);

    let welcome = rx.try_recv().expect("welcome queued on connect");
    assert_eq!(welcome.kind, protocol::kind::CONNECTION_ESTABLISHED);
    let data = welcome.data.unwrap();
    assert_eq!(data["connectionId"], json!(id));
    assert_eq!(data["categories"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn new_connection_has_empty_subscription_set() {
    let broker = make_broker();
    let (id, _rx) = attach(&broker, 8);
    assert!(broker.subscriptions(id).unwrap().is_empty());
}

#[tokio::test]
async fn subscription_mutation_is_idempotent() {
    let broker = make_broker();
    let (id, _rx) = attach(&broker, 8);

    assert!(broker.subscribe(id, Category::Roads));
    assert!(!broker.subscribe(id, Category::Roads));
    assert_eq!(broker.subscriptions(id).unwrap().len(), 1);

    assert!(broker.unsubscribe(id, Category::Roads));
    // Unsubscribing an absent category is a no-op
    assert!(!broker.unsubscribe(id, Category::Roads));
    assert!(broker.subscriptions(id).unwrap().is_empty());
}

#[tokio::test]
async fn subscribe_replies_with_confirmation() {
    let broker = make_broker();
    let (id, mut rx) = attach(&broker, 8);
    rx.try_recv().unwrap(); // welcome

    broker.subscribe(id, Category::Vehicles);
    let confirmation = rx.try_recv().unwrap();
    assert_eq!(confirmation.kind, protocol::kind::SUBSCRIPTION_CONFIRMED);
    assert_eq!(confirmation.data_type, Some(Category::Vehicles));
}

#[tokio::test]
async fn broadcast_reaches_only_subscribed_connections() {
    let broker = make_broker();
    let (first, mut first_rx) = attach(&broker, 8);
    let (second, mut second_rx) = attach(&broker, 8);
    first_rx.try_recv().unwrap();
    second_rx.try_recv().unwrap();

    broker.subscribe(first, Category::Vehicles);
    broker.subscribe(first, Category::Roads);
    broker.subscribe(second, Category::Roads);
    first_rx.try_recv().unwrap();
    first_rx.try_recv().unwrap();
    second_rx.try_recv().unwrap();

    let batch = json!([{"id": "veh_1"}, {"id": "veh_2"}, {"id": "veh_3"}]);
    let delivered = broker.broadcast(Category::Vehicles, batch);
    assert_eq!(delivered, 1);

    let frame = first_rx.try_recv().unwrap();
    assert_eq!(frame.kind, "vehicles");
    assert_eq!(frame.data.unwrap().as_array().unwrap().len(), 3);
    assert!(second_rx.try_recv().is_err());
}

#[tokio::test]
async fn saturated_peer_drops_frames_without_stalling_others() {
    let broker = make_broker();
    // Slow peer: single-slot buffer already holding the welcome message
    let (slow, _slow_rx) = attach(&broker, 1);
    let (fast, mut fast_rx) = attach(&broker, 8);
    fast_rx.try_recv().unwrap();

    broker.subscribe(slow, Category::Vehicles);
    broker.subscribe(fast, Category::Vehicles);
    fast_rx.try_recv().unwrap();

    let before = broker.dropped_frames();
    let delivered = broker.broadcast(Category::Vehicles, json!([]));
    assert_eq!(delivered, 1);
    assert!(broker.dropped_frames() > before);
    assert_eq!(fast_rx.try_recv().unwrap().kind, "vehicles");
}

#[tokio::test]
async fn send_to_connection_unicasts() {
    let broker = make_broker();
    let (id, mut rx) = attach(&broker, 8);
    rx.try_recv().unwrap();

    broker
        .send_to_connection(id, Envelope::error("just you"))
        .unwrap();
    assert_eq!(rx.try_recv().unwrap().kind, protocol::kind::ERROR);

    let missing = Uuid::new_v4();
    assert_eq!(
        broker.send_to_connection(missing, Envelope::pong()),
        Err(SendError::UnknownConnection(missing))
    );
}

#[tokio::test]
async fn deregister_discards_subscriptions_and_fires_event() {
    let broker = make_broker();
    let mut events = broker.events();
    let (id, _rx) = attach(&broker, 8);
    broker.subscribe(id, Category::Intersections);

    broker.deregister(id);
    assert!(broker.subscriptions(id).is_none());
    assert_eq!(broker.connection_count(), 0);

    // Connected, SubscriptionChanged, Disconnected, in that order
    assert!(matches!(events.try_recv(), Ok(BrokerEvent::Connected { .. })));
    assert!(matches!(
        events.try_recv(),
        Ok(BrokerEvent::SubscriptionChanged { subscribed: true, .. })
    ));
    assert!(matches!(
        events.try_recv(),
        Ok(BrokerEvent::Disconnected { .. })
    ));
}

#[tokio::test]
async fn metrics_go_to_every_connection() {
    let broker = make_broker();
    let (_, mut first_rx) = attach(&broker, 8);
    let (_, mut second_rx) = attach(&broker, 8);
    first_rx.try_recv().unwrap();
    second_rx.try_recv().unwrap();

    let snapshot = crate::record::MetricsSnapshot {
        vehicle_count: 12,
        average_speed: 31.0,
        average_waiting_time: 4.0,
        average_travel_time: 90.0,
        total_emissions: 0.0,
        throughput: 480.0,
        congestion_index: 0.2,
        timestamp: crate::record::now_ms(),
    };
    assert_eq!(broker.broadcast_metrics(&snapshot), 2);
    assert_eq!(
        first_rx.try_recv().unwrap().kind,
        protocol::kind::TRAFFIC_METRICS
    );
    assert_eq!(
        second_rx.try_recv().unwrap().kind,
        protocol::kind::TRAFFIC_METRICS
    );
}

#[tokio::test]
async fn simulation_update_is_filtered_per_peer() {
    let broker = make_broker();
    let (vehicles_only, mut vehicles_rx) = attach(&broker, 8);
    let (roads_only, mut roads_rx) = attach(&broker, 8);
    let (_unsubscribed, mut other_rx) = attach(&broker, 8);
    vehicles_rx.try_recv().unwrap();
    roads_rx.try_recv().unwrap();
    other_rx.try_recv().unwrap();

    broker.subscribe(vehicles_only, Category::Vehicles);
    broker.subscribe(roads_only, Category::Roads);
    vehicles_rx.try_recv().unwrap();
    roads_rx.try_recv().unwrap();

    let update = SimulationUpdate {
        vehicles: Some(json!([{"id": "veh_1"}])),
        roads: Some(json!([{"id": "edge_1"}])),
        ..Default::default()
    };
    let delivered = broker.broadcast_simulation_update(&update);
    assert_eq!(delivered, 2);

    let frame = vehicles_rx.try_recv().unwrap();
    let data = frame.data.unwrap();
    assert!(data.get("vehicles").is_some());
    assert!(data.get("roads").is_none());

    let frame = roads_rx.try_recv().unwrap();
    let data = frame.data.unwrap();
    assert!(data.get("roads").is_some());
    assert!(data.get("vehicles").is_none());

    assert!(other_rx.try_recv().is_err());
}
