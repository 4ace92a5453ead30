//! Wire formats shared by the relay and the measurement client.
//!
//! - `envelope`: relay frames and the base64(JSON) payload codec
//! - `negotiation`: pairing tokens, offer/answer/candidate messages, data channel setup
//! - `probe`: latency packets and speed-test control tokens

pub mod envelope;
pub mod negotiation;
pub mod probe;

pub use envelope::{Envelope, PayloadError, RENDEZVOUS_ADDRESS};
pub use negotiation::{
    ChannelConfig, IceCandidate, PairingMessage, SdpType, SessionDescription, SignalMessage,
    LATENCY_CHANNEL, THROUGHPUT_CHANNEL,
};
pub use probe::{ControlToken, PingPacket};
