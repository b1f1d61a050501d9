use crate::broker::protocol::{kind, Envelope, SimulationUpdate};
use crate::config::AgentConfig;
use crate::ledger::{ErrorKind, ErrorLedger};
use crate::record::{now_ms, Category};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

mod backoff;
mod transport;

pub use backoff::reconnect_delay;
pub use transport::{Connector, Transport, TransportError, WsConnector};

/// Client-observed connection health, updated on every lifecycle event and
/// on every received message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
    /// Milliseconds between the timestamp echoed by the peer and local
    /// receive time, clamped at zero.
    pub latency_ms: Option<i64>,
    pub reconnect_attempts: u32,
    pub error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            connected: false,
            last_update: None,
            latency_ms: None,
            reconnect_attempts: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; only an explicit `connect` leaves this
    /// state.
    GivingUp,
}

#[derive(Debug)]
pub enum AgentError {
    /// Fatal to the triggering attempt only; never retried automatically.
    Configuration(String),
    Connect(String),
    Timeout(Duration),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Configuration(e) => write!(f, "configuration error: {}", e),
            AgentError::Connect(e) => write!(f, "connect failed: {}", e),
            AgentError::Timeout(after) => write!(f, "connect timed out after {:?}", after),
        }
    }
}

impl std::error::Error for AgentError {}

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// What a callback is attached to: a data category, or one of the
/// broadcast-to-all feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StreamKey {
    Data(Category),
    Metrics,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Subscribe(Category),
    Unsubscribe(Category),
}

#[derive(Default)]
struct AgentTasks {
    run: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct AgentShared {
    config: AgentConfig,
    connector: Arc<dyn Connector>,
    ledger: Arc<ErrorLedger>,
    state: RwLock<ConnectionState>,
    phase: Mutex<AgentPhase>,
    /// Subscribe/unsubscribe requests made while offline, flushed in order
    /// once the connection comes up.
    pending: Mutex<Vec<Intent>>,
    subscribers: Mutex<HashMap<StreamKey, Vec<(u64, Callback)>>>,
    /// Last full batch per category; replaces wholesale, never merges.
    cache: Mutex<HashMap<Category, Value>>,
    latest_metrics: Mutex<Option<Value>>,
    latest_upstream: Mutex<Option<Value>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    tasks: Mutex<AgentTasks>,
    shutdown: AtomicBool,
    /// Bumped per established connection so a superseded run loop's cleanup
    /// can't clobber the live one.
    generation: AtomicU64,
    next_callback_id: AtomicU64,
}

/// One logical client connection to the broker.
///
/// Owns the whole connection lifecycle: connect with timeout, keepalive
/// pings, reconnect with capped exponential backoff, per-category callback
/// registry with last-batch replay, and the observable `ConnectionState`.
/// All timers live inside abortable tasks, so `disconnect` cancels
/// everything at once.
pub struct StreamAgent {
    shared: Arc<AgentShared>,
}

impl StreamAgent {
    pub fn new(config: AgentConfig, ledger: Arc<ErrorLedger>) -> Self {
        Self::with_connector(config, ledger, Arc::new(WsConnector))
    }

    /// Build with an explicit transport connector; tests use an in-memory
    /// one.
    pub fn with_connector(
        config: AgentConfig,
        ledger: Arc<ErrorLedger>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            shared: Arc::new(AgentShared {
                config,
                connector,
                ledger,
                state: RwLock::new(ConnectionState::default()),
                phase: Mutex::new(AgentPhase::Disconnected),
                pending: Mutex::new(Vec::new()),
                subscribers: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                latest_metrics: Mutex::new(None),
                latest_upstream: Mutex::new(None),
                outbound: Mutex::new(None),
                tasks: Mutex::new(AgentTasks::default()),
                shutdown: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                next_callback_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open the connection. A no-op when already connected. Resets the
    /// reconnect counter, so this is also the only way out of `GivingUp`.
    /// Connection and timeout failures are reported to the caller and
    /// handed to the reconnect policy; configuration failures are not
    /// retried.
    pub async fn connect(&self) -> Result<(), AgentError> {
        if self.phase() == AgentPhase::Connected {
            return Ok(());
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);
        if let Some(task) = self.shared.tasks.lock().unwrap().reconnect.take() {
            task.abort();
        }
        self.shared.state.write().unwrap().reconnect_attempts = 0;

        match attempt_open(&self.shared).await {
            Ok(()) => Ok(()),
            Err(e @ AgentError::Configuration(_)) => Err(e),
            Err(e) => {
                schedule_reconnect(Arc::clone(&self.shared));
                Err(e)
            }
        }
    }

    /// Tear the connection down and cancel every outstanding timer:
    /// reconnect, keepalive, and any in-flight attempt. Idempotent, and it
    /// wins over any scheduled reconnect.
    pub async fn disconnect(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let (run, reconnect) = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            (tasks.run.take(), tasks.reconnect.take())
        };
        if let Some(task) = reconnect {
            task.abort();
        }
        // Dropping the outbound sender makes the run loop exit cleanly
        *self.shared.outbound.lock().unwrap() = None;
        if let Some(task) = run {
            let _ = task.await;
        }
        set_phase(&self.shared, AgentPhase::Disconnected);
        let mut state = self.shared.state.write().unwrap();
        state.connected = false;
        state.last_update = Some(Utc::now());
    }

    /// Register a callback for one category. The last cached batch, if any,
    /// is replayed to the new callback immediately. The first callback for
    /// a category requests it from the broker (or queues the request while
    /// offline); the returned handle's `close` undoes the registration and,
    /// when it was the last one, unsubscribes.
    pub fn subscribe<F>(&self, category: Category, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.add_subscriber(StreamKey::Data(category), Arc::new(callback))
    }

    /// Aggregate metrics are not a subscription category; the broker sends
    /// them to every viewer.
    pub fn subscribe_metrics<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.add_subscriber(StreamKey::Metrics, Arc::new(callback))
    }

    /// Upstream-source connectivity notifications.
    pub fn subscribe_upstream_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.add_subscriber(StreamKey::Upstream, Arc::new(callback))
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.shared.state.read().unwrap().clone()
    }

    pub fn phase(&self) -> AgentPhase {
        *self.shared.phase.lock().unwrap()
    }

    pub fn cached_batch(&self, category: Category) -> Option<Value> {
        self.shared.cache.lock().unwrap().get(&category).cloned()
    }

    pub fn latest_metrics(&self) -> Option<Value> {
        self.shared.latest_metrics.lock().unwrap().clone()
    }

    pub fn latest_upstream_status(&self) -> Option<Value> {
        self.shared.latest_upstream.lock().unwrap().clone()
    }

    fn add_subscriber(&self, key: StreamKey, callback: Callback) -> Subscription {
        let replay = match key {
            StreamKey::Data(category) => {
                self.shared.cache.lock().unwrap().get(&category).cloned()
            }
            StreamKey::Metrics => self.shared.latest_metrics.lock().unwrap().clone(),
            StreamKey::Upstream => self.shared.latest_upstream.lock().unwrap().clone(),
        };
        if let Some(batch) = replay {
            callback(&batch);
        }

        let id = self.shared.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut subscribers = self.shared.subscribers.lock().unwrap();
            let list = subscribers.entry(key).or_default();
            let first = list.is_empty();
            list.push((id, callback));
            first
        };
        if first {
            if let StreamKey::Data(category) = key {
                request(&self.shared, Intent::Subscribe(category));
            }
        }
        Subscription {
            shared: Arc::downgrade(&self.shared),
            key,
            id,
            active: true,
        }
    }

    #[cfg(test)]
    fn pending_intents(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }
}

/// Handle returned by `subscribe`; closing it detaches the callback and,
/// when it was the category's last, sends an unsubscribe. Dropping the
/// handle does the same.
pub struct Subscription {
    shared: Weak<AgentShared>,
    key: StreamKey,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let emptied = {
            let mut subscribers = shared.subscribers.lock().unwrap();
            match subscribers.get_mut(&self.key) {
                Some(list) => {
                    list.retain(|(id, _)| *id != self.id);
                    let empty = list.is_empty();
                    if empty {
                        subscribers.remove(&self.key);
                    }
                    empty
                }
                None => false,
            }
        };
        if emptied {
            if let StreamKey::Data(category) = self.key {
                request(&shared, Intent::Unsubscribe(category));
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

fn set_phase(shared: &Arc<AgentShared>, phase: AgentPhase) {
    *shared.phase.lock().unwrap() = phase;
}

fn set_error(shared: &Arc<AgentShared>, message: &str) {
    let mut state = shared.state.write().unwrap();
    state.error = Some(message.to_string());
    state.last_update = Some(Utc::now());
}

/// Send now when connected, otherwise queue for the flush that follows the
/// next successful connect. Queued intents collapse: a subscribe cancels a
/// queued unsubscribe for the same category and vice versa, so at most one
/// message per category is flushed.
fn request(shared: &Arc<AgentShared>, intent: Intent) {
    let connected = *shared.phase.lock().unwrap() == AgentPhase::Connected;
    if connected {
        if let Some(tx) = shared.outbound.lock().unwrap().as_ref() {
            let _ = tx.send(intent_envelope(intent));
            return;
        }
    }
    queue_intent(shared, intent);
}

fn intent_envelope(intent: Intent) -> Envelope {
    match intent {
        Intent::Subscribe(category) => Envelope::subscribe(category),
        Intent::Unsubscribe(category) => Envelope::unsubscribe(category),
    }
}

fn queue_intent(shared: &Arc<AgentShared>, intent: Intent) {
    let mut pending = shared.pending.lock().unwrap();
    match intent {
        Intent::Subscribe(category) => {
            if let Some(pos) = pending
                .iter()
                .position(|i| *i == Intent::Unsubscribe(category))
            {
                pending.remove(pos);
            }
            if !pending.contains(&intent) {
                pending.push(intent);
            }
        }
        Intent::Unsubscribe(category) => {
            if let Some(pos) = pending
                .iter()
                .position(|i| *i == Intent::Subscribe(category))
            {
                // Net zero: the broker never saw the subscribe
                pending.remove(pos);
            } else if !pending.contains(&intent) {
                pending.push(intent);
            }
        }
    }
}

/// One connection attempt: validate the url, open the transport under the
/// configured timeout, and hand a successful open to the run loop.
async fn attempt_open(shared: &Arc<AgentShared>) -> Result<(), AgentError> {
    let url = shared.config.url.clone();
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        let message = format!("unsupported url scheme: {}", url);
        shared
            .ledger
            .record(ErrorKind::Configuration, message.clone(), None);
        set_error(shared, &message);
        set_phase(shared, AgentPhase::Disconnected);
        return Err(AgentError::Configuration(message));
    }

    set_phase(shared, AgentPhase::Connecting);
    let connect_timeout = Duration::from_secs(shared.config.connect_timeout_secs.max(1));
    match timeout(connect_timeout, shared.connector.connect(&url)).await {
        Ok(Ok(transport)) => {
            start_run_loop(shared, transport);
            Ok(())
        }
        Ok(Err(e)) => {
            let message = e.to_string();
            shared
                .ledger
                .record(ErrorKind::Connection, message.clone(), None);
            set_error(shared, &message);
            set_phase(shared, AgentPhase::Disconnected);
            Err(AgentError::Connect(message))
        }
        Err(_) => {
            let message = format!("connect timed out after {}s", connect_timeout.as_secs());
            shared
                .ledger
                .record(ErrorKind::Timeout, message.clone(), None);
            set_error(shared, &message);
            set_phase(shared, AgentPhase::Disconnected);
            Err(AgentError::Timeout(connect_timeout))
        }
    }
}

fn start_run_loop(shared: &Arc<AgentShared>, transport: Box<dyn Transport>) {
    if shared.shutdown.load(Ordering::SeqCst) {
        // A disconnect raced the open; dropping the transport closes it
        return;
    }
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, rx) = mpsc::unbounded_channel();

    // Flush intents queued while offline, in request order, ahead of
    // anything else the connection sends.
    {
        let mut pending = shared.pending.lock().unwrap();
        for intent in pending.drain(..) {
            let _ = tx.send(intent_envelope(intent));
        }
    }
    *shared.outbound.lock().unwrap() = Some(tx);

    set_phase(shared, AgentPhase::Connected);
    {
        let mut state = shared.state.write().unwrap();
        state.connected = true;
        state.reconnect_attempts = 0;
        state.error = None;
        state.last_update = Some(Utc::now());
    }
    info!(url = %shared.config.url, "connected to broker");

    let inner = Arc::clone(shared);
    let handle = tokio::spawn(run_loop(inner, generation, transport, rx));
    shared.tasks.lock().unwrap().run = Some(handle);
}

async fn run_loop(
    shared: Arc<AgentShared>,
    generation: u64,
    mut transport: Box<dyn Transport>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut ping = interval(Duration::from_secs(shared.config.ping_interval_secs.max(1)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await; // consume the immediate first tick

    let reason: Option<String> = loop {
        tokio::select! {
            queued = outbound_rx.recv() => {
                let Some(envelope) = queued else {
                    // Sender dropped: deliberate teardown
                    break None;
                };
                if let Err(e) = send_envelope(transport.as_mut(), &envelope).await {
                    break Some(e);
                }
            }

            inbound = transport.recv() => {
                match inbound {
                    Some(Ok(text)) => {
                        if let Some(reply) = handle_frame(&shared, &text) {
                            if let Err(e) = send_envelope(transport.as_mut(), &reply).await {
                                break Some(e);
                            }
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("connection closed by peer".to_string()),
                }
            }

            _ = ping.tick() => {
                if let Err(e) = send_envelope(transport.as_mut(), &Envelope::ping()).await {
                    break Some(e);
                }
            }
        }
    };

    transport.close().await;

    if shared.generation.load(Ordering::SeqCst) != generation {
        // A newer connection took over while this one was winding down
        return;
    }

    *shared.outbound.lock().unwrap() = None;
    set_phase(&shared, AgentPhase::Disconnected);
    {
        let mut state = shared.state.write().unwrap();
        state.connected = false;
        state.last_update = Some(Utc::now());
        if let Some(reason) = &reason {
            state.error = Some(reason.clone());
        }
    }

    let Some(reason) = reason else { return };
    if shared.shutdown.load(Ordering::SeqCst) {
        return;
    }

    warn!(reason = %reason, "connection lost");
    shared.ledger.record(ErrorKind::Connection, reason, None);
    requeue_active_subscriptions(&shared);
    schedule_reconnect(shared);
}

async fn send_envelope(
    transport: &mut dyn Transport,
    envelope: &Envelope,
) -> Result<(), String> {
    let frame = serde_json::to_string(envelope).map_err(|e| e.to_string())?;
    transport.send(frame).await.map_err(|e| e.to_string())
}

/// Categories with live callbacks are re-requested on the next connection.
fn requeue_active_subscriptions(shared: &Arc<AgentShared>) {
    let active: Vec<Category> = {
        let subscribers = shared.subscribers.lock().unwrap();
        Category::ALL
            .into_iter()
            .filter(|c| {
                subscribers
                    .get(&StreamKey::Data(*c))
                    .map_or(false, |list| !list.is_empty())
            })
            .collect()
    };
    for category in active {
        queue_intent(shared, Intent::Subscribe(category));
    }
}

/// Back off and retry until a connect succeeds, the attempt limit is
/// reached, or an explicit disconnect wins.
fn schedule_reconnect(shared: Arc<AgentShared>) {
    if shared.shutdown.load(Ordering::SeqCst) {
        return;
    }
    let mut tasks = shared.tasks.lock().unwrap();
    if tasks
        .reconnect
        .as_ref()
        .map_or(false, |task| !task.is_finished())
    {
        return;
    }
    let inner = Arc::clone(&shared);
    tasks.reconnect = Some(tokio::spawn(async move {
        loop {
            let attempt = {
                let mut state = inner.state.write().unwrap();
                if state.reconnect_attempts >= inner.config.max_reconnect_attempts {
                    drop(state);
                    give_up(&inner);
                    return;
                }
                state.reconnect_attempts += 1;
                state.reconnect_attempts
            };
            let delay = reconnect_delay(
                inner.config.reconnect_base_ms,
                inner.config.reconnect_cap_ms,
                attempt,
            );
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::time::sleep(delay).await;
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match attempt_open(&inner).await {
                Ok(()) => return,
                Err(AgentError::Configuration(_)) => return,
                Err(_) => continue,
            }
        }
    }));
}

fn give_up(shared: &Arc<AgentShared>) {
    let message = format!(
        "giving up after {} reconnect attempts",
        shared.config.max_reconnect_attempts
    );
    warn!("{}", message);
    shared
        .ledger
        .record(ErrorKind::Connection, message.clone(), None);
    set_error(shared, &message);
    set_phase(shared, AgentPhase::GivingUp);
}

/// Process one inbound frame. Returns a reply to send, if any.
fn handle_frame(shared: &Arc<AgentShared>, text: &str) -> Option<Envelope> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            shared.ledger.record(
                ErrorKind::Validation,
                format!("unparseable server message: {}", e),
                None,
            );
            return None;
        }
    };

    observe_envelope(shared, &envelope);

    if let Some(category) = envelope.category() {
        if let Some(data) = envelope.data {
            apply_batch(shared, category, data);
        }
        return None;
    }

    let Envelope {
        kind: msg_kind,
        data,
        ..
    } = envelope;

    match msg_kind.as_str() {
        kind::SIMULATION_UPDATE => {
            if let Some(Value::Object(update)) = data {
                // Each included category replaces its cache atomically
                for category in Category::ALL {
                    if let Some(batch) = update.get(SimulationUpdate::field_name(category)) {
                        apply_batch(shared, category, batch.clone());
                    }
                }
            }
            None
        }
        kind::TRAFFIC_METRICS => {
            if let Some(data) = data {
                *shared.latest_metrics.lock().unwrap() = Some(data.clone());
                dispatch(shared, StreamKey::Metrics, &data);
            }
            None
        }
        kind::UPSTREAM_STATUS => {
            if let Some(data) = data {
                *shared.latest_upstream.lock().unwrap() = Some(data.clone());
                dispatch(shared, StreamKey::Upstream, &data);
            }
            None
        }
        kind::PING => Some(Envelope::pong()),
        kind::PONG | kind::SUBSCRIPTION_CONFIRMED | kind::CONNECTION_ESTABLISHED => None,
        kind::ERROR => {
            let message = data
                .as_ref()
                .and_then(|d| d.as_str())
                .unwrap_or("server error")
                .to_string();
            shared.ledger.record(ErrorKind::Unknown, message.clone(), None);
            shared.state.write().unwrap().error = Some(message);
            None
        }
        other => {
            debug!(kind = other, "ignoring message");
            None
        }
    }
}

/// Latency comes from the timestamp echoed in every message, not only
/// pongs.
fn observe_envelope(shared: &Arc<AgentShared>, envelope: &Envelope) {
    let mut state = shared.state.write().unwrap();
    state.last_update = Some(Utc::now());
    if let Some(sent_at) = envelope.timestamp {
        state.latency_ms = Some((now_ms() - sent_at).max(0));
    }
}

fn apply_batch(shared: &Arc<AgentShared>, category: Category, data: Value) {
    shared.cache.lock().unwrap().insert(category, data.clone());
    dispatch(shared, StreamKey::Data(category), &data);
}

/// Callbacks for one key run sequentially, outside the registry lock.
fn dispatch(shared: &Arc<AgentShared>, key: StreamKey, data: &Value) {
    let callbacks: Vec<Callback> = {
        let subscribers = shared.subscribers.lock().unwrap();
        subscribers
            .get(&key)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    };
    for callback in callbacks {
        callback(data);
    }
}
