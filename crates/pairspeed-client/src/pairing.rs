//! Identifier registration and the PING/PONG handshake.
//!
//! ```text
//!  A                          relay                          B
//!  send({}, 0)  ─────────────▶ You=A        You=B ◀───────────── send({}, 0)
//!  user types B's words
//!  send("PING", B) ─────────────────────────────▶ read(): PING from A
//!  read(): PONG from B ◀────────────────────────── send("PONG", A)
//!  Initiator (+B)                                 Responder (-A)
//! ```

use std::fmt;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info};

use pairspeed_types::{PairingMessage, RENDEZVOUS_ADDRESS};

use crate::error::{Error, Result, ValidationError};
use crate::signal::SignalChannel;
use crate::sink::{StatusSink, StatusUpdate};
use crate::words::Dictionary;

/// Which side of the handshake we ended up on. The initiator makes the
/// transport offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Side bit used to tag latency probes.
    pub fn side(self) -> u8 {
        match self {
            Self::Initiator => 1,
            Self::Responder => 0,
        }
    }

    pub fn is_initiator(self) -> bool {
        self == Self::Initiator
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedPeer {
    pub peer: u64,
    pub role: Role,
}

impl PairedPeer {
    /// Peer id, negated when we are the responder.
    pub fn signed(&self) -> i64 {
        match self.role {
            Role::Initiator => self.peer as i64,
            Role::Responder => -(self.peer as i64),
        }
    }
}

pub struct Pairing {
    channel: SignalChannel,
    own_id: u64,
    dictionary: Dictionary,
    timeout: Option<Duration>,
    /// Last peer we sent a PING to.
    pinged: Mutex<Option<u64>>,
}

impl Pairing {
    /// Ask the rendezvous address for our identifier.
    pub async fn register(channel: SignalChannel, timeout: Option<Duration>) -> Result<Self> {
        let reply = channel
            .send(&serde_json::json!({}), RENDEZVOUS_ADDRESS, timeout)
            .await?;
        let own_id = reply
            .you
            .ok_or_else(|| Error::protocol("rendezvous reply without You"))?;
        info!(own_id, "registered with relay");
        Ok(Self {
            channel,
            own_id,
            dictionary: Dictionary::english(),
            timeout,
            pinged: Mutex::new(None),
        })
    }

    pub fn with_dictionary(mut self, dictionary: Dictionary) -> Self {
        self.dictionary = dictionary;
        self
    }

    pub fn own_id(&self) -> u64 {
        self.own_id
    }

    pub fn own_words(&self) -> String {
        self.dictionary.render(self.own_id)
    }

    pub fn channel(&self) -> &SignalChannel {
        &self.channel
    }

    /// Decode the peer's words and send it a PING. Validation failures send
    /// nothing and leave the channel usable.
    pub async fn submit(&self, input: &str) -> Result<u64> {
        let peer = self
            .dictionary
            .decode(input)
            .ok_or(ValidationError::InvalidIdentifier)?;
        if peer == self.own_id {
            return Err(ValidationError::SelfPairing.into());
        }

        *self.pinged.lock() = Some(peer);
        let ack = self.channel.send(&PairingMessage::Ping, peer, self.timeout).await?;
        if ack.deliverable == Some(false) {
            return Err(ValidationError::UnknownPeer.into());
        }
        debug!(peer, "pairing request delivered");
        Ok(peer)
    }

    /// Take the first relayed message, which must be a PING or a PONG.
    ///
    /// Two users who type each other's words at the same time both receive
    /// a PING. Both answer with a PONG, and the larger identifier takes the
    /// initiator role so exactly one side offers.
    pub async fn await_peer(&self) -> Result<PairedPeer> {
        let delivery = self.channel.read(None).await?;
        let message: PairingMessage = delivery.decode().map_err(|_| {
            Error::protocol(format!("unexpected pairing message {}", delivery.data))
        })?;
        let peer = delivery.src;

        let role = match message {
            PairingMessage::Ping => {
                self.channel.send(&PairingMessage::Pong, peer, self.timeout).await?;
                let crossed = *self.pinged.lock() == Some(peer);
                if crossed && self.own_id > peer {
                    debug!(peer, "crossed pairing requests, taking initiator role");
                    Role::Initiator
                } else {
                    Role::Responder
                }
            }
            PairingMessage::Pong => Role::Initiator,
        };
        info!(peer, %role, "paired");
        Ok(PairedPeer { peer, role })
    }

    /// Run the pairing form: show our words, feed each submission to
    /// [`submit`](Self::submit) and report validation problems, until a peer
    /// completes the handshake.
    pub async fn pair<S>(&self, mut submissions: S, sink: &dyn StatusSink) -> Result<PairedPeer>
    where
        S: Stream<Item = String> + Unpin,
    {
        sink.update(StatusUpdate::Identifier { words: self.own_words() });

        let waiting = self.await_peer();
        tokio::pin!(waiting);
        let mut form_open = true;

        loop {
            tokio::select! {
                paired = &mut waiting => {
                    let paired = paired?;
                    sink.update(StatusUpdate::Paired { peer: paired.peer, role: paired.role });
                    return Ok(paired);
                }
                input = submissions.next(), if form_open => {
                    let Some(input) = input else {
                        form_open = false;
                        continue;
                    };
                    match self.submit(&input).await {
                        Ok(_) => {}
                        Err(Error::Validation(e)) => {
                            sink.update(StatusUpdate::PairingMessage { message: e.to_string() });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}
