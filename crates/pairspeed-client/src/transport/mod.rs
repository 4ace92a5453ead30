//! Direct-transport capability surface.
//!
//! The real-time transport is external: it hands the client ordered data
//! channels that report open/message/error/close through an
//! [`EventSource`] and expose their outgoing buffer depth. [`loopback`]
//! provides an in-process pair for tests and local runs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::event::{EventSource, Payload};

/// Sending side of a data channel as exposed by the transport.
pub trait DataChannel: Send + Sync {
    /// Queue `payload` for transmission. Never blocks.
    fn send(&self, payload: Payload) -> Result<()>;

    /// Bytes queued locally but not yet handed to the network.
    fn buffered_amount(&self) -> usize;
}

/// A data channel plus its event stream.
pub struct TransportChannel {
    label: String,
    link: Arc<dyn DataChannel>,
    pub events: EventSource,
}

impl TransportChannel {
    pub fn new(label: impl Into<String>, link: Arc<dyn DataChannel>, events: EventSource) -> Self {
        Self { label: label.into(), link, events }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Shared handle to the sending side, for pumps that outlive a borrow.
    pub fn link(&self) -> Arc<dyn DataChannel> {
        self.link.clone()
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.link.send(Payload::Text(text.into()))
    }

    pub fn send_binary(&self, data: Bytes) -> Result<()> {
        self.link.send(Payload::Binary(data))
    }

    pub fn buffered_amount(&self) -> usize {
        self.link.buffered_amount()
    }

    /// Wait until the outgoing buffer has drained.
    pub async fn flush(&self) {
        flush(self.link.as_ref()).await
    }

    pub fn split(self) -> (Arc<dyn DataChannel>, EventSource) {
        (self.link, self.events)
    }
}

/// Re-check interval while a slow transport drains.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) async fn flush(link: &dyn DataChannel) {
    while link.buffered_amount() > 0 {
        tokio::task::yield_now().await;
        if link.buffered_amount() > 0 {
            tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
        }
    }
}

pub mod loopback;
