//! Async framing over the duplex relay socket.
//!
//! The socket reports through an [`EventSource`]: `Open` once connected (or
//! `Error` if the dial fails), then `Message` per text frame, and `Error` or
//! `Close` when it ends. Outbound frames go through a [`RelaySender`].

use async_stream::try_stream;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventEmitter, EventKind, EventSource, Payload, event_channel};

/// Outbound half of a relay link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<String>,
}

impl RelaySender {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: String) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::transport("relay socket closed"))
    }
}

pub struct RelayLink {
    sender: RelaySender,
    events: EventSource,
}

impl RelayLink {
    /// Assemble a link from an outbound queue and the socket's event source.
    pub fn from_parts(sender: RelaySender, events: EventSource) -> Self {
        Self { sender, events }
    }

    /// Wait for the socket to come up. Fails if the first outcome is an
    /// error (or the socket closes) instead of a successful open.
    pub async fn open(mut self) -> Result<Self> {
        match self
            .events
            .next_of(&[EventKind::Open, EventKind::Error, EventKind::Close])
            .await
        {
            Some(Event::Open) => Ok(self),
            Some(Event::Error(e)) => Err(Error::transport(format!("relay open failed: {}", e))),
            _ => Err(Error::transport("relay closed before opening")),
        }
    }

    pub fn send(&self, frame: String) -> Result<()> {
        self.sender.send(frame)
    }

    /// Lazy stream of inbound text frames. Raises on the socket's error
    /// event; an unexpected close is a failure as well.
    pub fn read(&mut self) -> impl Stream<Item = Result<String>> + Send + '_ {
        frames(&mut self.events)
    }

    pub fn into_parts(self) -> (RelaySender, EventSource) {
        (self.sender, self.events)
    }
}

pub fn frames(events: &mut EventSource) -> impl Stream<Item = Result<String>> + Send + '_ {
    try_stream! {
        loop {
            let event = events
                .next_of(&[EventKind::Message, EventKind::Error, EventKind::Close])
                .await;
            let text = match event {
                Some(Event::Message(Payload::Text(text))) => Ok(text),
                Some(Event::Message(Payload::Binary(b))) => Err(Error::protocol(format!(
                    "unexpected {}-byte binary relay frame",
                    b.len()
                ))),
                Some(Event::Error(e)) => Err(Error::transport(e)),
                _ => Err(Error::transport("relay connection closed")),
            }?;
            yield text;
        }
    }
}

/// Dial the relay over WebSocket. Returns immediately; the outcome of the
/// dial arrives as the link's first event.
pub fn connect(url: &str) -> RelayLink {
    let (emitter, events) = event_channel();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let url = url.to_string();
    tokio::spawn(run_socket(url, emitter, rx));
    RelayLink::from_parts(RelaySender::new(tx), events)
}

async fn run_socket(url: String, emitter: EventEmitter, mut outbound: mpsc::UnboundedReceiver<String>) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("relay dial to {} failed: {}", url, e);
            emitter.emit(Event::Error(e.to_string()));
            return;
        }
    };
    info!("connected to relay at {}", url);
    emitter.emit(Event::Open);

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Every sender dropped: local side is done with the link.
                    let _ = sink.close().await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    emitter.emit(Event::Error(e.to_string()));
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        emitter.emit(Event::Message(Payload::Text(text.as_str().to_owned())));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        emitter.emit(Event::Message(Payload::Binary(data)));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("relay closed the connection");
                        emitter.emit(Event::Close);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("relay socket error: {}", e);
                        emitter.emit(Event::Error(e.to_string()));
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted() -> (EventEmitter, mpsc::UnboundedReceiver<String>, RelayLink) {
        let (emitter, events) = event_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        (emitter, rx, RelayLink::from_parts(RelaySender::new(tx), events))
    }

    #[tokio::test]
    async fn open_fails_on_error_first() {
        let (emitter, _rx, link) = scripted();
        emitter.emit(Event::Error("refused".into()));
        emitter.emit(Event::Open);
        let err = link.open().await.err().unwrap();
        assert!(matches!(err, Error::TransportFailure(msg) if msg.contains("refused")));
    }

    #[tokio::test]
    async fn read_yields_frames_then_raises() {
        let (emitter, mut rx, link) = scripted();
        emitter.emit(Event::Open);
        let mut link = link.open().await.unwrap();

        link.send("out".into()).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("out"));

        emitter.emit(Event::Message("a".into()));
        emitter.emit(Event::Message("b".into()));
        emitter.emit(Event::Error("reset".into()));

        let frames = link.read();
        futures_util::pin_mut!(frames);
        assert_eq!(frames.next().await, Some(Ok("a".to_string())));
        assert_eq!(frames.next().await, Some(Ok("b".to_string())));
        assert_eq!(frames.next().await, Some(Err(Error::transport("reset"))));
        assert_eq!(frames.next().await, None);
    }

    #[tokio::test]
    async fn dial_failure_surfaces_on_open() {
        // Port 1 on loopback refuses connections.
        let link = connect("ws://127.0.0.1:1/signal");
        assert!(matches!(link.open().await, Err(Error::TransportFailure(_))));
    }
}
