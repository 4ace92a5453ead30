//! Event sources and the race over them.
//!
//! Every asynchronous producer in the client (relay socket, data channels,
//! UI controls) reports through an [`EventEmitter`]; the consumer side is an
//! [`EventSource`]. [`select`] waits on several (source, kinds) pairs at
//! once and resolves with whichever matching event arrives first.
//!
//! ```text
//! relay socket ──emit──▶ EventSource ─┐
//! data channel ──emit──▶ EventSource ─┼─▶ select([...]) ─▶ Fired { index, event }
//! test button  ──emit──▶ EventSource ─┘
//! ```

use std::future::poll_fn;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
    /// User control activation.
    Trigger,
}

/// Message body on a socket or data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    /// Byte length of a binary payload. Text frames carry control tokens
    /// and do not count towards transfer totals.
    pub fn binary_len(&self) -> Option<usize> {
        match self {
            Self::Binary(b) => Some(b.len()),
            Self::Text(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Message(Payload),
    Error(String),
    Close,
    /// Control activation carrying the user's chosen value (payload size).
    Trigger(u64),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
            Self::Close => EventKind::Close,
            Self::Trigger(_) => EventKind::Trigger,
        }
    }
}

/// Create a connected emitter/source pair.
pub fn event_channel() -> (EventEmitter, EventSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventEmitter { tx },
        EventSource { rx, listeners: 0, ended: false },
    )
}

/// Producer half. Cheap to clone; the source sees `Close` once every clone
/// has been dropped.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventEmitter {
    /// Returns false if the source is gone.
    pub fn emit(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half. Events queue here until a listener takes them.
#[derive(Debug)]
pub struct EventSource {
    rx: mpsc::UnboundedReceiver<Event>,
    listeners: usize,
    ended: bool,
}

impl EventSource {
    /// Number of (source, kind) listeners currently registered by races.
    pub fn listener_count(&self) -> usize {
        self.listeners
    }

    /// Wait for the next event of one of `kinds`, discarding others.
    pub async fn next_of(&mut self, kinds: &[EventKind]) -> Option<Event> {
        select(vec![on(self, kinds)]).await.map(|fired| fired.event)
    }

    /// Poll for the next event of one of `kinds`. Events of other kinds have
    /// no listener and are dropped. Once the emitter is gone a single
    /// synthetic `Close` is offered; after that the source is exhausted.
    fn poll_matching(&mut self, kinds: &[EventKind], cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.ended {
            return Poll::Ready(None);
        }
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    if kinds.contains(&event.kind()) {
                        return Poll::Ready(Some(event));
                    }
                    tracing::trace!(kind = ?event.kind(), "event without listener dropped");
                }
                Poll::Ready(None) => {
                    self.ended = true;
                    if kinds.contains(&EventKind::Close) {
                        return Poll::Ready(Some(Event::Close));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// One race participant: a source and the event kinds listened for on it.
pub struct Arm<'a> {
    source: &'a mut EventSource,
    kinds: &'a [EventKind],
    exhausted: bool,
}

pub fn on<'a>(source: &'a mut EventSource, kinds: &'a [EventKind]) -> Arm<'a> {
    Arm { source, kinds, exhausted: false }
}

/// Outcome of a race: which arm won (registration index) and its event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub index: usize,
    pub event: Event,
}

/// Registered listeners for one race. Dropping it deregisters them all,
/// whether the race resolved or was abandoned.
struct Registration<'a> {
    arms: Vec<Arm<'a>>,
}

impl<'a> Registration<'a> {
    fn new(mut arms: Vec<Arm<'a>>) -> Self {
        for arm in arms.iter_mut() {
            arm.source.listeners += arm.kinds.len();
        }
        Self { arms }
    }

    fn poll_first(&mut self, cx: &mut Context<'_>) -> Poll<Option<Fired>> {
        let mut live = 0;
        for (index, arm) in self.arms.iter_mut().enumerate() {
            if arm.exhausted {
                continue;
            }
            match arm.source.poll_matching(arm.kinds, cx) {
                Poll::Ready(Some(event)) => return Poll::Ready(Some(Fired { index, event })),
                Poll::Ready(None) => arm.exhausted = true,
                Poll::Pending => live += 1,
            }
        }
        if live == 0 { Poll::Ready(None) } else { Poll::Pending }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        for arm in self.arms.iter_mut() {
            arm.source.listeners -= arm.kinds.len();
        }
    }
}

/// Race the given arms. Resolves exactly once with the first matching event;
/// when several are ready in the same poll the earliest-registered arm wins
/// and the others' events stay queued on their sources. Resolves to `None`
/// if every source ends without producing a match.
pub async fn select(arms: Vec<Arm<'_>>) -> Option<Fired> {
    let mut registration = Registration::new(arms);
    poll_fn(|cx| registration.poll_first(cx)).await
}
