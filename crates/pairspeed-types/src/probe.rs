//! Measurement channel payloads.
//!
//! Latency channel: JSON text `{"side":0|1,"key":<ms>}`.
//! Throughput channel: binary chunks plus the text tokens below.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPacket {
    /// 1 for the initiator, 0 for the responder.
    pub side: u8,
    /// Sender's timestamp in milliseconds, doubling as the correlation key.
    pub key: u64,
}

/// Text frames exchanged on the throughput channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    End,
    EndAck,
    TestAck,
    /// Payload size in bytes announced by the side starting the test.
    Size(u64),
}

impl ControlToken {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "END" => Some(Self::End),
            "END-ACK" => Some(Self::EndAck),
            "TEST-ACK" => Some(Self::TestAck),
            other if !other.is_empty() && other.bytes().all(|b| b.is_ascii_digit()) => {
                other.parse().ok().map(Self::Size)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::End => write!(f, "END"),
            Self::EndAck => write!(f, "END-ACK"),
            Self::TestAck => write!(f, "TEST-ACK"),
            Self::Size(bytes) => write!(f, "{}", bytes),
        }
    }
}
