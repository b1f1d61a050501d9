use super::{protocol::ClientRequest, Envelope, StreamBroker};
use crate::ledger::ErrorKind;
use axum::extract::ws::{Message, WebSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drive one WebSocket connection for its whole lifetime.
///
/// The select loop multiplexes inbound client frames, the connection's
/// outbound queue, and the idle-timeout check. Any inbound traffic counts as
/// liveness; a peer silent past the configured timeout is closed
/// proactively.
pub async fn handle_connection(mut socket: WebSocket, broker: Arc<StreamBroker>) {
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Envelope>(broker.config().outbound_buffer);
    let id = broker.register(outbound_tx.clone());
    info!(connection = %id, "client connected");

    let idle_timeout = Duration::from_secs(broker.config().idle_timeout_secs.max(1));
    let mut idle_check = interval(idle_timeout / 4);
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        handle_text(id, &broker, &outbound_tx, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_seen = Instant::now();
                        if let Err(e) = socket.send(Message::Pong(payload)).await {
                            warn!(connection = %id, error = %e, "failed to send pong");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(connection = %id, "client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames count as traffic only
                        last_seen = Instant::now();
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "websocket error");
                        break;
                    }
                }
            }

            queued = outbound_rx.recv() => {
                let Some(envelope) = queued else { break };
                let frame = match serde_json::to_string(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(connection = %id, error = %e, "failed to serialize frame");
                        continue;
                    }
                };
                if let Err(e) = socket.send(Message::Text(frame)).await {
                    warn!(connection = %id, error = %e, "failed to send frame");
                    break;
                }
            }

            _ = idle_check.tick() => {
                if last_seen.elapsed() >= idle_timeout {
                    info!(connection = %id, "idle timeout, closing connection");
                    break;
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    broker.deregister(id);
    info!(connection = %id, "connection closed");
}

fn handle_text(
    id: Uuid,
    broker: &StreamBroker,
    outbound: &mpsc::Sender<Envelope>,
    text: &str,
) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            broker.ledger().record(
                ErrorKind::Validation,
                format!("unparseable client message: {}", e),
                None,
            );
            let _ = outbound.try_send(Envelope::error("invalid message"));
            return;
        }
    };

    match ClientRequest::from_envelope(&envelope) {
        Some(ClientRequest::Subscribe(category)) => {
            broker.subscribe(id, category);
        }
        Some(ClientRequest::Unsubscribe(category)) => {
            broker.unsubscribe(id, category);
        }
        Some(ClientRequest::Ping) => {
            let _ = outbound.try_send(Envelope::pong());
        }
        Some(ClientRequest::Pong) => {}
        None => {
            debug!(connection = %id, kind = %envelope.kind, "ignoring message");
        }
    }
}
