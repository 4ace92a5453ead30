//! Status surface for whatever renders the session.
//!
//! The session reports formatted values here. Implementations can drive a
//! UI, write to tracing, or discard them.

use std::fmt;

use tokio::sync::mpsc;

use crate::pairing::Role;
use crate::throughput::Direction;

/// One display update.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Our own identifier, as words for the user to share.
    Identifier { words: String },
    /// Pairing form feedback ("Invalid identifier." and friends).
    PairingMessage { message: String },
    /// Handshake done.
    Paired { peer: u64, role: Role },
    /// Whether the test control accepts input.
    Controls { enabled: bool },
    /// Latest round trip; `None` clears the display.
    Latency { text: Option<String> },
    /// Windowed rate during a phase.
    Rate { direction: Direction, text: String },
    /// Share of the agreed size moved so far.
    Progress { direction: Direction, text: String },
    /// Whole-phase average once a phase ends.
    Average { direction: Direction, text: String },
    Error { message: String },
}

impl StatusUpdate {
    fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Identifier { .. }
                | Self::PairingMessage { .. }
                | Self::Paired { .. }
                | Self::Average { .. }
                | Self::Error { .. }
        )
    }
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identifier { words } => write!(f, "identifier words=\"{}\"", words),
            Self::PairingMessage { message } => write!(f, "pairing message=\"{}\"", message),
            Self::Paired { peer, role } => write!(f, "paired peer={} role={}", peer, role),
            Self::Controls { enabled } => write!(f, "controls enabled={}", enabled),
            Self::Latency { text: Some(text) } => write!(f, "latency {}", text),
            Self::Latency { text: None } => write!(f, "latency cleared"),
            Self::Rate { direction, text } => write!(f, "{} rate {}", direction, text),
            Self::Progress { direction, text } => write!(f, "{} progress {}", direction, text),
            Self::Average { direction, text } => write!(f, "{} average {}", direction, text),
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

pub trait StatusSink: Send + Sync {
    fn update(&self, update: StatusUpdate);
}

/// Sink that uses the `tracing` crate.
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn update(&self, update: StatusUpdate) {
        // info for lifecycle, debug for per-report updates
        if update.is_lifecycle() {
            tracing::info!(target: "pairspeed::status", "{}", update);
        } else {
            tracing::debug!(target: "pairspeed::status", "{}", update);
        }
    }
}

/// Discards everything.
pub struct NullSink;

impl StatusSink for NullSink {
    fn update(&self, _update: StatusUpdate) {}
}

/// Forwards updates to a renderer running elsewhere. Updates sent after the
/// receiver is gone are dropped.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn update(&self, update: StatusUpdate) {
        let _ = self.tx.send(update);
    }
}
