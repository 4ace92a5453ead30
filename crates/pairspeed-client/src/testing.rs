//! Scripted relay for unit tests: the test plays the relay's side of the
//! socket by hand.

use pairspeed_types::Envelope;
use pairspeed_types::envelope::encode_payload;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::event::{Event, EventEmitter, event_channel};
use crate::relay_link::{RelayLink, RelaySender};
use crate::signal::SignalChannel;

pub struct ScriptedRelay {
    pub relay: EventEmitter,
    pub outbound: mpsc::UnboundedReceiver<String>,
}

/// An open signal channel wired to a scripted relay.
pub async fn scripted_channel() -> (ScriptedRelay, SignalChannel) {
    let (relay, events) = event_channel();
    let (tx, outbound) = mpsc::unbounded_channel();
    relay.emit(Event::Open);
    let link = RelayLink::from_parts(RelaySender::new(tx), events);
    let channel = SignalChannel::open(link).await.unwrap();
    (ScriptedRelay { relay, outbound }, channel)
}

impl ScriptedRelay {
    pub async fn next_request(&mut self) -> Envelope {
        let text = self.outbound.recv().await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    pub fn no_request_pending(&mut self) -> bool {
        self.outbound.try_recv().is_err()
    }

    pub fn reply(&self, env: Envelope) {
        self.relay
            .emit(Event::Message(serde_json::to_string(&env).unwrap().into()));
    }

    /// Answer the next request with an ack.
    pub async fn ack_next(&mut self, deliverable: bool, you: u64) -> Envelope {
        let req = self.next_request().await;
        self.reply(Envelope::ack(req.id.unwrap(), deliverable, you));
        req
    }

    pub fn deliver<T: Serialize + ?Sized>(&self, src: u64, payload: &T) {
        let env = Envelope::delivery(src, 1, encode_payload(payload).unwrap());
        self.reply(env);
    }
}
