//! Peer pairing and link measurement client.
//!
//! Two peers meet through a relay, exchange human-readable identifiers,
//! negotiate a direct transport and then measure round-trip latency and
//! throughput over it.
//!
//! - `sync`: semaphore, bounded queue and one-shot rendezvous
//! - `event`: event sources and the first-event race over them
//! - `relay_link` / `signal`: relay socket framing and request/reply correlation
//! - `words` / `pairing`: identifier words and the PING/PONG handshake
//! - `negotiation` / `transport`: engine capability surface and data channels
//! - `latency` / `throughput` / `driver`: the measurements
//! - `format` / `sink` / `session`: display strings and the session loop

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod format;
pub mod latency;
pub mod negotiation;
pub mod pairing;
pub mod relay_link;
pub mod session;
pub mod signal;
pub mod sink;
pub mod sync;
pub mod throughput;
pub mod transport;
pub mod words;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use error::{Error, Result, ValidationError};
pub use pairing::{PairedPeer, Pairing, Role};
pub use session::{SessionIo, run_session};
pub use signal::{Delivery, SignalChannel};
