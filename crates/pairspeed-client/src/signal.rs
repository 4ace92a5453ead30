//! Correlated request/reply and peer message delivery over one relay link.
//!
//! ```text
//!            send(payload, dest) ──{Id,Dest,Datab64}──▶ relay
//! pending[Id] ◀──────────────────────{Id,Deliverable,You}── relay
//! inbound queue (100) ◀──────────────{Datab64,Src,Dest}──── relay
//! ```
//!
//! A background pump owns the read side. The first pump failure is stored
//! as the channel's sticky failure: it is returned by every blocked and
//! every later `send`/`read`, and the pending table is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use pairspeed_types::Envelope;

use crate::error::{Error, Result};
use crate::event::EventSource;
use crate::relay_link::{self, RelayLink, RelaySender};
use crate::sync::{BoundedQueue, RendezvousChannel};

/// Unconsumed peer traffic held before the pump stops reading the relay.
pub const INBOUND_CAPACITY: usize = 100;

/// A peer message relayed to us.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub data: serde_json::Value,
    pub src: u64,
    pub dest: u64,
}

impl Delivery {
    fn from_envelope(envelope: Envelope) -> Result<Self> {
        let data = envelope.payload()?;
        let src = envelope
            .src
            .ok_or_else(|| Error::protocol("relayed message without Src"))?;
        Ok(Self { data, src, dest: envelope.dest.unwrap_or_default() })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

#[derive(Clone)]
pub struct SignalChannel {
    inner: Arc<Inner>,
}

struct Inner {
    sender: RelaySender,
    last_id: AtomicU64,
    pending: Mutex<HashMap<u64, Arc<RendezvousChannel<Envelope>>>>,
    inbound: BoundedQueue<Delivery>,
    failure: OnceLock<Error>,
    failed: CancellationToken,
}

impl SignalChannel {
    /// Open `link` and start the pump.
    pub async fn open(link: RelayLink) -> Result<Self> {
        let link = link.open().await?;
        Ok(Self::start(link))
    }

    /// Start the pump on a link that is already open.
    pub fn start(link: RelayLink) -> Self {
        let (sender, events) = link.into_parts();
        let inner = Arc::new(Inner {
            sender,
            last_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            inbound: BoundedQueue::new(INBOUND_CAPACITY),
            failure: OnceLock::new(),
            failed: CancellationToken::new(),
        });
        tokio::spawn(pump(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// Send `payload` to `dest` and wait (at most `timeout`) for the relay's
    /// reply. A reply that arrives after the timeout is absorbed silently.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        dest: u64,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let inner = &self.inner;
        inner.check()?;

        // Ids start at 1: the relay reads id 0 as end of stream.
        let id = inner.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = serde_json::to_string(&Envelope::request(id, dest, payload)?)?;

        let slot = Arc::new(RendezvousChannel::new());
        inner.pending.lock().insert(id, slot.clone());
        if let Err(e) = inner.sender.send(frame) {
            inner.fail(e);
            return Err(inner.sticky());
        }
        trace!(id, dest, "relay request sent");

        tokio::select! {
            biased;
            _ = inner.failed.cancelled() => Err(inner.sticky()),
            reply = slot.get(timeout) => {
                if let Err(Error::Timeout(_)) = &reply {
                    // The slot stays so a late reply is absorbed; it is
                    // only reclaimed by that reply or by channel failure.
                    debug!(id, dest, lingering = inner.pending.lock().len(), "relay request timed out");
                }
                reply
            }
        }
    }

    /// Next relayed peer message, waiting at most `timeout`.
    pub async fn read(&self, timeout: Option<Duration>) -> Result<Delivery> {
        let inner = &self.inner;
        inner.check()?;
        tokio::select! {
            biased;
            _ = inner.failed.cancelled() => Err(inner.sticky()),
            delivery = inner.inbound.get(timeout) => delivery,
        }
    }

    /// Next message from `peer`; messages from anyone else are discarded.
    pub async fn read_from(&self, peer: u64, timeout: Option<Duration>) -> Result<Delivery> {
        loop {
            let delivery = self.read(timeout).await?;
            if delivery.src == peer {
                return Ok(delivery);
            }
            debug!(src = delivery.src, peer, "discarding message from unpaired source");
        }
    }

    /// The sticky failure, once set.
    pub fn failure(&self) -> Option<Error> {
        self.inner.failure.get().cloned()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failure.get().is_some()
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Inner {
    fn check(&self) -> Result<()> {
        match self.failure.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn sticky(&self) -> Error {
        self.failure
            .get()
            .cloned()
            .unwrap_or_else(|| Error::transport("signal channel failed"))
    }

    /// Record the first failure, wake every blocked caller, drop the
    /// pending table.
    fn fail(&self, error: Error) {
        let error = error.into_fatal();
        if self.failure.set(error.clone()).is_ok() {
            warn!("signal channel failed: {}", error);
        }
        self.failed.cancel();
        let abandoned = std::mem::take(&mut *self.pending.lock());
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "failing outstanding relay requests");
        }
    }

    async fn dispatch(&self, text: &str) -> Result<()> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if let Some(id) = envelope.id {
            let slot = self
                .pending
                .lock()
                .remove(&id)
                .ok_or_else(|| Error::protocol(format!("reply for unknown request id {}", id)))?;
            // Single put into a fresh one-slot channel never waits.
            slot.put(envelope, None).await?;
        } else if envelope.datab64.is_some() {
            let delivery = Delivery::from_envelope(envelope)?;
            trace!(src = delivery.src, "relayed message queued");
            self.inbound.put(delivery, None).await?;
        } else {
            debug!("ignoring relay frame without id or payload");
        }
        Ok(())
    }
}

async fn pump(inner: Weak<Inner>, mut events: EventSource) {
    let frames = relay_link::frames(&mut events);
    futures_util::pin_mut!(frames);
    loop {
        let next = frames.next().await;
        let Some(inner) = inner.upgrade() else {
            debug!("signal channel dropped, pump exiting");
            return;
        };
        let outcome = match next {
            Some(Ok(text)) => inner.dispatch(&text).await,
            Some(Err(e)) => Err(e),
            None => Err(Error::transport("relay connection closed")),
        };
        if let Err(e) = outcome {
            inner.fail(e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::testing::scripted_channel;
    use serde_json::json;

    #[tokio::test]
    async fn send_resolves_with_matching_reply() {
        let (mut relay, channel) = scripted_channel().await;
        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.send(&json!({}), 0, None).await });

        let req = relay.next_request().await;
        assert_eq!(req.id, Some(1));
        assert_eq!(req.dest, Some(0));
        assert_eq!(req.payload::<serde_json::Value>().unwrap(), json!({}));

        relay.reply(Envelope::ack(1, false, 4242));
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.you, Some(4242));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn request_ids_increase() {
        let (mut relay, channel) = scripted_channel().await;
        for expected in 1..=3u64 {
            let caller = channel.clone();
            let call = tokio::spawn(async move { caller.send("PING", 9, None).await });
            let req = relay.ack_next(true, 1).await;
            assert_eq!(req.id, Some(expected));
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn reads_deliveries_in_order() {
        let (relay, channel) = scripted_channel().await;
        for i in 0..150u64 {
            relay.deliver(7, &i);
        }
        for i in 0..150u64 {
            let d = channel.read(None).await.unwrap();
            assert_eq!(d.src, 7);
            assert_eq!(d.decode::<u64>().unwrap(), i);
        }
    }

    #[tokio::test]
    async fn read_from_skips_other_sources() {
        let (relay, channel) = scripted_channel().await;
        relay.deliver(5, "noise");
        relay.deliver(6, "wanted");
        let d = channel.read_from(6, None).await.unwrap();
        assert_eq!(d.decode::<String>().unwrap(), "wanted");
    }

    #[tokio::test]
    async fn transport_error_poisons_blocked_and_future_calls() {
        let (mut relay, channel) = scripted_channel().await;

        let reader = channel.clone();
        let blocked_read = tokio::spawn(async move { reader.read(None).await });
        let sender = channel.clone();
        let blocked_send = tokio::spawn(async move { sender.send("PING", 3, None).await });
        let _ = relay.next_request().await;

        relay.relay.emit(Event::Error("connection reset".into()));

        let expected = Error::transport("connection reset");
        assert_eq!(blocked_read.await.unwrap(), Err(expected.clone()));
        assert_eq!(blocked_send.await.unwrap(), Err(expected.clone()));
        assert_eq!(channel.read(None).await, Err(expected.clone()));
        assert_eq!(
            channel.send("PING", 3, None).await.map(|_| ()),
            Err(expected.clone())
        );
        assert_eq!(channel.failure(), Some(expected));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn relay_close_is_a_transport_failure() {
        let (relay, channel) = scripted_channel().await;
        drop(relay);
        assert_eq!(
            channel.read(None).await,
            Err(Error::transport("relay connection closed"))
        );
    }

    #[tokio::test]
    async fn reply_for_unknown_id_is_fatal() {
        let (relay, channel) = scripted_channel().await;
        relay.reply(Envelope::ack(99, true, 1));
        let err = channel.read(None).await.unwrap_err();
        assert_eq!(
            err,
            Error::transport("protocol violation: reply for unknown request id 99")
        );
        assert!(channel.is_failed());
    }

    #[tokio::test]
    async fn malformed_frame_is_fatal() {
        let (relay, channel) = scripted_channel().await;
        relay.relay.emit(Event::Message("{not json".into()));
        let err = channel.read(None).await.unwrap_err();
        assert!(matches!(err, Error::TransportFailure(msg) if msg.starts_with("protocol violation")));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_absorbed() {
        let (mut relay, channel) = scripted_channel().await;
        let err = channel
            .send("PING", 3, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        relay.ack_next(true, 1).await;

        // Channel still healthy: a fresh request round-trips.
        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.send("PING", 3, None).await });
        relay.ack_next(true, 1).await;
        assert!(call.await.unwrap().is_ok());
        assert!(!channel.is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_requests_linger_until_answered() {
        let (mut relay, channel) = scripted_channel().await;
        for _ in 0..3 {
            let err = channel
                .send("PING", 3, Some(Duration::from_millis(100)))
                .await
                .unwrap_err();
            assert!(err.is_timeout());
        }
        assert_eq!(channel.pending_requests(), 3);

        for _ in 0..3 {
            relay.ack_next(true, 1).await;
        }
        for _ in 0..100 {
            if channel.pending_requests() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(channel.pending_requests(), 0);
        assert!(!channel.is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_is_not_sticky() {
        let (relay, channel) = scripted_channel().await;
        let err = channel.read(Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(err.is_timeout());
        relay.deliver(2, "later");
        assert_eq!(channel.read(None).await.unwrap().src, 2);
    }
}
