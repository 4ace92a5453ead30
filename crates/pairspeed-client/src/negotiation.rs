//! Offer/answer/candidate exchange with the paired peer.
//!
//! ```text
//! initiator: Idle ─negotiation needed─▶ Offering ─offer sent─▶ AwaitingAnswer ─answer─▶ Connected
//! responder: Idle ─▶ AwaitingOffer ─offer─▶ Answering ─answer sent─▶ Connected
//! ```
//!
//! Candidates are relayed in both directions whenever they turn up. The
//! driver runs as its own task; the rest of the session only watches its
//! state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pairspeed_types::{
    ChannelConfig, IceCandidate, LATENCY_CHANNEL, SessionDescription, SignalMessage,
    THROUGHPUT_CHANNEL,
};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, on, select};
use crate::pairing::{PairedPeer, Role};
use crate::signal::SignalChannel;
use crate::transport::TransportChannel;

/// Notifications from the local transport engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSignal {
    /// The engine wants a (re)negotiation.
    NegotiationNeeded,
    /// A local candidate was found. `None` marks the end of gathering.
    Candidate(Option<IceCandidate>),
}

/// The local real-time transport engine.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Create a pre-negotiated data channel.
    async fn open_channel(&self, config: ChannelConfig) -> Result<TransportChannel>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AwaitingOffer,
    Answering,
    Connected,
    /// The driver stopped on this error.
    Failed(Error),
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Offering => f.write_str("offering"),
            Self::AwaitingAnswer => f.write_str("awaiting-answer"),
            Self::AwaitingOffer => f.write_str("awaiting-offer"),
            Self::Answering => f.write_str("answering"),
            Self::Connected => f.write_str("connected"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Handle to the background negotiation task. Dropping it stops the task.
pub struct NegotiationDriver {
    state: watch::Receiver<NegotiationState>,
    task: JoinHandle<()>,
}

impl NegotiationDriver {
    pub fn spawn(
        engine: Arc<dyn NegotiationEngine>,
        signals: mpsc::UnboundedReceiver<EngineSignal>,
        channel: SignalChannel,
        peer: PairedPeer,
        timeout: Option<Duration>,
    ) -> Self {
        let (state_tx, state) = watch::channel(NegotiationState::Idle);
        let task = tokio::spawn(async move {
            let pump = Pump { engine, channel, peer, timeout, state: state_tx };
            if let Err(e) = pump.run(signals).await {
                warn!(peer = pump.peer.peer, "negotiation stopped: {}", e);
                pump.set(NegotiationState::Failed(e));
            }
        });
        Self { state, task }
    }

    pub fn state(&self) -> NegotiationState {
        self.state.borrow().clone()
    }

    /// Wait for the first offer/answer exchange to complete.
    pub async fn connected(&mut self) -> Result<()> {
        let state = self
            .state
            .wait_for(|s| matches!(s, NegotiationState::Connected | NegotiationState::Failed(_)))
            .await
            .map_err(|_| Error::transport("negotiation driver stopped"))?
            .clone();
        match state {
            NegotiationState::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Resolves once the driver has stopped on an error.
    pub async fn failure(&mut self) -> Error {
        match self
            .state
            .wait_for(|s| matches!(s, NegotiationState::Failed(_)))
            .await
        {
            Ok(state) => match &*state {
                NegotiationState::Failed(e) => e.clone(),
                _ => Error::transport("negotiation driver stopped"),
            },
            Err(_) => Error::transport("negotiation driver stopped"),
        }
    }

    /// Watch every state change.
    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }
}

impl Drop for NegotiationDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Pump {
    engine: Arc<dyn NegotiationEngine>,
    channel: SignalChannel,
    peer: PairedPeer,
    timeout: Option<Duration>,
    state: watch::Sender<NegotiationState>,
}

impl Pump {
    fn set(&self, next: NegotiationState) {
        debug!(peer = self.peer.peer, state = %next, "negotiation state");
        self.state.send_replace(next);
    }

    fn current(&self) -> NegotiationState {
        self.state.borrow().clone()
    }

    async fn run(&self, mut signals: mpsc::UnboundedReceiver<EngineSignal>) -> Result<()> {
        if self.peer.role == Role::Responder {
            self.set(NegotiationState::AwaitingOffer);
        }
        let mut signals_open = true;

        loop {
            tokio::select! {
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => self.on_engine_signal(signal).await?,
                    None => {
                        debug!("engine signal stream ended");
                        signals_open = false;
                    }
                },
                delivery = self.channel.read_from(self.peer.peer, None) => {
                    let delivery = delivery?;
                    match delivery.decode::<SignalMessage>() {
                        Ok(message) => self.on_peer_message(message).await?,
                        Err(_) => debug!(data = %delivery.data, "ignoring non-negotiation message from peer"),
                    }
                }
            }
        }
    }

    async fn on_engine_signal(&self, signal: EngineSignal) -> Result<()> {
        match signal {
            EngineSignal::NegotiationNeeded if self.peer.role == Role::Initiator => {
                self.set(NegotiationState::Offering);
                let offer = self.engine.create_offer().await?;
                self.engine.set_local_description(offer.clone()).await?;
                self.relay(SignalMessage::Offer(offer)).await?;
                self.set(NegotiationState::AwaitingAnswer);
            }
            EngineSignal::NegotiationNeeded => {
                debug!("responder ignores negotiation-needed");
            }
            EngineSignal::Candidate(Some(candidate)) => {
                self.relay(SignalMessage::Candidate(candidate)).await?;
            }
            EngineSignal::Candidate(None) => {
                debug!("local candidate gathering complete");
            }
        }
        Ok(())
    }

    async fn on_peer_message(&self, message: SignalMessage) -> Result<()> {
        debug!(kind = message.name(), "negotiation message from peer");
        match message {
            SignalMessage::Offer(offer) => {
                self.set(NegotiationState::Answering);
                self.engine.set_remote_description(offer).await?;
                let answer = self.engine.create_answer().await?;
                self.engine.set_local_description(answer.clone()).await?;
                self.relay(SignalMessage::Answer(answer)).await?;
                self.connected();
            }
            SignalMessage::Answer(answer) => {
                let state = self.current();
                if state != NegotiationState::AwaitingAnswer {
                    warn!(%state, "answer arrived outside awaiting-answer, applying anyway");
                }
                self.engine.set_remote_description(answer).await?;
                self.connected();
            }
            SignalMessage::Candidate(candidate) => {
                self.engine.add_ice_candidate(candidate).await?;
            }
        }
        Ok(())
    }

    fn connected(&self) {
        if self.current() != NegotiationState::Connected {
            info!(peer = self.peer.peer, role = %self.peer.role, "transport negotiated");
        }
        self.set(NegotiationState::Connected);
    }

    async fn relay(&self, message: SignalMessage) -> Result<()> {
        let kind = message.name();
        let ack = self.channel.send(&message, self.peer.peer, self.timeout).await?;
        if ack.deliverable == Some(false) {
            warn!(kind, peer = self.peer.peer, "peer is no longer reachable through the relay");
        }
        Ok(())
    }
}

/// The two measurement channels, open.
pub struct MeasurementChannels {
    pub latency: TransportChannel,
    pub throughput: TransportChannel,
}

/// Create both pre-negotiated channels and wait until each reports open.
pub async fn establish_channels(engine: &dyn NegotiationEngine) -> Result<MeasurementChannels> {
    let mut latency = engine.open_channel(LATENCY_CHANNEL).await?;
    let mut throughput = engine.open_channel(THROUGHPUT_CHANNEL).await?;
    tokio::try_join!(wait_open(&mut latency), wait_open(&mut throughput))?;
    info!("measurement channels open");
    Ok(MeasurementChannels { latency, throughput })
}

async fn wait_open(channel: &mut TransportChannel) -> Result<()> {
    let label = channel.label().to_owned();
    let kinds = [EventKind::Open, EventKind::Error, EventKind::Close];
    let fired = select(vec![on(&mut channel.events, &kinds)]).await;
    match fired.map(|f| f.event) {
        Some(Event::Open) => {
            debug!(label, "data channel open");
            Ok(())
        }
        Some(Event::Error(e)) => Err(Error::transport(format!("channel {} failed to open: {}", label, e))),
        _ => Err(Error::transport(format!("channel {} closed before opening", label))),
    }
}
