//! Round-trip probing over the latency channel.
//!
//! Both peers probe over the same channel. Each packet carries the sender's
//! side bit: a packet with our side is a returning probe, anything else is
//! the peer's probe and is echoed back unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_stream::try_stream;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use pairspeed_types::PingPacket;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventSource, Payload};
use crate::transport::{DataChannel, TransportChannel};

pub const DEFAULT_PROBE_PERIOD: Duration = Duration::from_secs(1);

/// Handle to a running probe. Clones share the reflector.
#[derive(Clone)]
pub struct LatencyProbe {
    inner: Arc<Inner>,
}

struct Inner {
    link: Arc<dyn DataChannel>,
    side: u8,
    period: Duration,
    outstanding: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    last_key: AtomicU64,
    failure: OnceLock<Error>,
    stopped: CancellationToken,
}

impl LatencyProbe {
    /// Start reflecting on `channel`. Probes sent through [`run`](Self::run)
    /// are tagged with `side`.
    pub fn spawn(channel: TransportChannel, side: u8, period: Duration) -> Self {
        let (link, events) = channel.split();
        let inner = Arc::new(Inner {
            link,
            side,
            period,
            outstanding: Mutex::new(HashMap::new()),
            last_key: AtomicU64::new(0),
            failure: OnceLock::new(),
            stopped: CancellationToken::new(),
        });
        tokio::spawn(reflect(inner.clone(), events));
        Self { inner }
    }

    /// Endless round-trip measurements. Each probe starts one period after
    /// the previous one was sent, or straight away if the round trip took
    /// longer than that. Fails once the channel has closed.
    pub fn run(&self) -> impl Stream<Item = Result<Duration>> + Send + 'static {
        let inner = self.inner.clone();
        try_stream! {
            loop {
                let sent_at = Instant::now();
                let rtt = inner.round_trip().await?;
                yield rtt;
                tokio::time::sleep_until(sent_at + inner.period).await;
            }
        }
    }

    pub fn side(&self) -> u8 {
        self.inner.side
    }

    /// Why the reflector stopped, once it has.
    pub fn failure(&self) -> Option<Error> {
        self.inner.failure.get().cloned()
    }
}

impl Inner {
    /// Millisecond wall-clock key, bumped past the previous one so no two
    /// probes share a key.
    fn next_key(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut prev = self.last_key.load(Ordering::Relaxed);
        loop {
            let key = now.max(prev + 1);
            match self
                .last_key
                .compare_exchange_weak(prev, key, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return key,
                Err(actual) => prev = actual,
            }
        }
    }

    fn sticky(&self) -> Error {
        self.failure
            .get()
            .cloned()
            .unwrap_or_else(|| Error::transport("latency channel closed"))
    }

    async fn round_trip(&self) -> Result<Duration> {
        if let Some(e) = self.failure.get() {
            return Err(e.clone());
        }
        let start = Instant::now();
        let key = self.next_key();
        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().insert(key, tx);

        let packet = serde_json::to_string(&PingPacket { side: self.side, key })?;
        if let Err(e) = self.link.send(Payload::Text(packet)) {
            self.outstanding.lock().remove(&key);
            return Err(e);
        }
        trace!(key, "probe sent");

        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => Err(self.sticky()),
            done = rx => done.map_err(|_| self.sticky()),
        }?;
        Ok(start.elapsed())
    }

    fn stop(&self, error: Error) {
        let error = error.into_fatal();
        if self.failure.set(error.clone()).is_ok() {
            debug!(side = self.side, "latency reflector stopped: {}", error);
        }
        self.stopped.cancel();
        self.outstanding.lock().clear();
    }

    fn on_packet(&self, text: String) -> Result<()> {
        let packet: PingPacket = serde_json::from_str(&text)?;
        if packet.side == self.side {
            match self.outstanding.lock().remove(&packet.key) {
                Some(done) => {
                    let _ = done.send(());
                }
                None => trace!(key = packet.key, "probe returned after it was abandoned"),
            }
            Ok(())
        } else {
            self.link.send(Payload::Text(text))
        }
    }
}

async fn reflect(inner: Arc<Inner>, mut events: EventSource) {
    let kinds = [EventKind::Message, EventKind::Error, EventKind::Close];
    loop {
        let outcome = match events.next_of(&kinds).await {
            Some(Event::Message(Payload::Text(text))) => inner.on_packet(text),
            Some(Event::Message(Payload::Binary(b))) => {
                warn!(len = b.len(), "binary frame on latency channel ignored");
                Ok(())
            }
            Some(Event::Error(e)) => Err(Error::transport(e)),
            _ => Err(Error::transport("latency channel closed")),
        };
        if let Err(e) = outcome {
            inner.stop(e);
            return;
        }
    }
}
