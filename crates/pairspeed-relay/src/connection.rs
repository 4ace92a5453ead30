use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};

use pairspeed_types::Envelope;

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: the relay sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const MAX_MISSED_PONGS: u8 = 2;

/// Serve one relay session until the client hangs up, sends `Id: 0`, sends
/// something unparseable or stops answering pings.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let (id, mut deliveries) = dispatcher.register();
    let (mut sender, mut receiver) = socket.split();
    info!(id, "relay session opened");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut liveness = Liveness::default();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Pong(_))) => {
                        liveness.pong();
                        continue;
                    }
                    Some(Ok(Message::Ping(_))) => continue,
                    Some(Ok(Message::Binary(_))) => {
                        warn!(id, "binary frame on relay session");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(id, "socket error: {}", e);
                        break;
                    }
                };

                let Some(request) = parse_request(text.as_str()) else {
                    warn!(id, "bad request: {}", text.chars().take(200).collect::<String>());
                    break;
                };
                let Some(request_id) = request.id.filter(|&r| r != 0) else {
                    debug!(id, "end of stream");
                    break;
                };

                let dest = request.dest.unwrap_or_default();
                let deliverable = dispatcher
                    .send_to(id, dest, request.datab64.unwrap_or_default())
                    .await;
                trace!(id, request_id, dest, deliverable, "relayed");

                let ack = Envelope::ack(request_id, deliverable, id);
                if send_frame(&mut sender, &ack).await.is_err() {
                    break;
                }
            }
            delivery = deliveries.recv() => {
                // The dispatcher holds our sender until we unregister.
                let Some(delivery) = delivery else { break };
                if send_frame(&mut sender, &delivery).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if !liveness.tick() {
                    warn!(id, "heartbeat timeout (missed {} pongs), dropping connection", MAX_MISSED_PONGS);
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    dispatcher.unregister(id);
    info!(id, "relay session closed");
}

fn parse_request(text: &str) -> Option<Envelope> {
    serde_json::from_str(text).ok()
}

async fn send_frame<S>(sender: &mut S, frame: &Envelope) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    // Envelope has only integer, bool and string fields.
    let text = serde_json::to_string(frame).unwrap_or_default();
    sender.send(Message::Text(text.into())).await
}

/// Counts heartbeats that went unanswered.
#[derive(Debug)]
struct Liveness {
    pong_received: bool,
    missed: u8,
}

impl Default for Liveness {
    fn default() -> Self {
        Self { pong_received: true, missed: 0 }
    }
}

impl Liveness {
    fn pong(&mut self) {
        self.pong_received = true;
    }

    /// Called on every heartbeat; false once the peer has missed too many.
    fn tick(&mut self) -> bool {
        if std::mem::replace(&mut self.pong_received, false) {
            self.missed = 0;
        } else {
            self.missed += 1;
        }
        self.missed < MAX_MISSED_PONGS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_after_two_missed_pongs() {
        let mut liveness = Liveness::default();
        assert!(liveness.tick());
        assert!(liveness.tick());
        assert!(!liveness.tick());
    }

    #[test]
    fn pong_resets_the_count() {
        let mut liveness = Liveness::default();
        assert!(liveness.tick());
        assert!(liveness.tick());
        liveness.pong();
        assert!(liveness.tick());
        assert!(liveness.tick());
        assert!(!liveness.tick());
    }

    #[test]
    fn parses_requests() {
        let req = parse_request(r#"{"Id":4,"Dest":0,"Datab64":"e30="}"#).unwrap();
        assert_eq!(req.id, Some(4));
        assert_eq!(req.dest, Some(0));
        assert!(parse_request("not json").is_none());
        assert_eq!(parse_request("{}").unwrap().id, None);
    }
}
