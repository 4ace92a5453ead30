//! Two channel ends joined in process. Each direction has a delivery task,
//! so `buffered_amount` reflects payloads not yet handed to the peer and
//! backpressure behaves like a real transport.
//!
//! [`engine_pair`] wraps the same plumbing in a pair of negotiation engines
//! for running whole sessions without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use pairspeed_types::{ChannelConfig, IceCandidate, SdpType, SessionDescription};

use super::{DataChannel, TransportChannel};
use crate::error::{Error, Result};
use crate::event::{Event, EventEmitter, Payload, event_channel};
use crate::negotiation::{EngineSignal, NegotiationEngine};

struct LoopbackLink {
    tx: mpsc::UnboundedSender<Payload>,
    buffered: Arc<AtomicUsize>,
}

impl DataChannel for LoopbackLink {
    fn send(&self, payload: Payload) -> Result<()> {
        let len = payload.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx.send(payload).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            Error::transport("loopback channel closed")
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

/// Connected pair with immediate delivery.
pub fn pair(label: &str) -> (TransportChannel, TransportChannel) {
    pair_with_delay(label, Duration::ZERO)
}

/// Connected pair where every payload is held for `delay` before it is
/// delivered. Both ends report `Open` straight away.
pub fn pair_with_delay(label: &str, delay: Duration) -> (TransportChannel, TransportChannel) {
    let (a, b) = unopened(label, delay);
    a.1.emit(Event::Open);
    b.1.emit(Event::Open);
    (a.0, b.0)
}

/// Joined ends, each with a handle for reporting its own `Open` later.
fn unopened(label: &str, delay: Duration) -> ((TransportChannel, EventEmitter), (TransportChannel, EventEmitter)) {
    let (a_emit, a_events) = event_channel();
    let (b_emit, b_events) = event_channel();

    let a_link = direction(b_emit.clone(), delay);
    let b_link = direction(a_emit.clone(), delay);

    (
        (TransportChannel::new(label, Arc::new(a_link), a_events), a_emit),
        (TransportChannel::new(label, Arc::new(b_link), b_events), b_emit),
    )
}

/// Spawn the delivery task for one direction. Once the sending end and
/// every open handle are gone the peer sees `Close`.
fn direction(peer: EventEmitter, delay: Duration) -> LoopbackLink {
    let (tx, mut rx) = mpsc::unbounded_channel::<Payload>();
    let buffered = Arc::new(AtomicUsize::new(0));
    let counter = buffered.clone();

    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            counter.fetch_sub(payload.len(), Ordering::AcqRel);
            if !peer.emit(Event::Message(payload)) {
                break;
            }
        }
    });

    LoopbackLink { tx, buffered }
}

/// In-process negotiation engine. Channels opened with the same id on both
/// engines of a pair are joined; they report `Open` once both sides have
/// applied a local and a remote description.
pub struct LoopbackEngine {
    side: usize,
    network: Arc<Mutex<Network>>,
    signals: mpsc::UnboundedSender<EngineSignal>,
}

#[derive(Default)]
struct Network {
    local: [Option<SessionDescription>; 2],
    remote: [Option<SessionDescription>; 2],
    candidates: [Vec<IceCandidate>; 2],
    wants_negotiation: [bool; 2],
    /// Ends created by one side, keyed by id with the side that will claim them.
    parked: HashMap<u16, (usize, TransportChannel, EventEmitter)>,
    /// Ends handed out before the link came up.
    unopened: Vec<EventEmitter>,
    delay: Duration,
}

impl Network {
    fn is_connected(&self) -> bool {
        self.local.iter().chain(self.remote.iter()).all(Option::is_some)
    }

    fn open_pending(&mut self) {
        if self.is_connected() {
            for end in self.unopened.drain(..) {
                end.emit(Event::Open);
            }
        }
    }
}

pub type EngineHandle = (Arc<LoopbackEngine>, mpsc::UnboundedReceiver<EngineSignal>);

/// Two engines sharing one in-process network.
pub fn engine_pair() -> (EngineHandle, EngineHandle) {
    engine_pair_with_delay(Duration::ZERO)
}

/// As [`engine_pair`], with every data channel payload held for `delay`.
pub fn engine_pair_with_delay(delay: Duration) -> (EngineHandle, EngineHandle) {
    let network = Arc::new(Mutex::new(Network { delay, ..Default::default() }));
    let make = |side| {
        let (signals, rx) = mpsc::unbounded_channel();
        (Arc::new(LoopbackEngine { side, network: network.clone(), signals }), rx)
    };
    (make(0), make(1))
}

impl LoopbackEngine {
    pub fn is_connected(&self) -> bool {
        self.network.lock().is_connected()
    }

    /// Candidates the peer has handed us so far.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.network.lock().candidates[self.side].clone()
    }

    fn description(&self, kind: SdpType) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\n", self.side),
        }
    }

    fn signal(&self, signal: EngineSignal) {
        let _ = self.signals.send(signal);
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(self.description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let has_offer = matches!(
            &self.network.lock().remote[self.side],
            Some(d) if d.kind == SdpType::Offer
        );
        if !has_offer {
            return Err(Error::protocol("answer requested without a remote offer"));
        }
        Ok(self.description(SdpType::Answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut net = self.network.lock();
            net.local[self.side] = Some(description);
            net.open_pending();
        }
        self.signal(EngineSignal::Candidate(Some(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host", self.side, 50000 + self.side),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        })));
        self.signal(EngineSignal::Candidate(None));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut net = self.network.lock();
        net.remote[self.side] = Some(description);
        net.open_pending();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.network.lock().candidates[self.side].push(candidate);
        Ok(())
    }

    async fn open_channel(&self, config: ChannelConfig) -> Result<TransportChannel> {
        let mut net = self.network.lock();
        let (channel, opener) = match net.parked.remove(&config.id) {
            Some((side, channel, opener)) if side == self.side => (channel, opener),
            Some(parked) => {
                net.parked.insert(config.id, parked);
                return Err(Error::transport(format!("channel id {} already open", config.id)));
            }
            None => {
                let (ours, theirs) = unopened(config.label, net.delay);
                net.parked.insert(config.id, (1 - self.side, theirs.0, theirs.1));
                ours
            }
        };
        net.unopened.push(opener);
        net.open_pending();

        if !net.wants_negotiation[self.side] {
            net.wants_negotiation[self.side] = true;
            self.signal(EngineSignal::NegotiationNeeded);
        }
        debug!(label = config.label, id = config.id, side = self.side, "loopback channel created");
        Ok(channel)
    }
}
