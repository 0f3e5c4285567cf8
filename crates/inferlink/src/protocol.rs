//! Wire envelope for client-host communication.
//!
//! Every message bearing a request id falls into one of three kinds:
//! - **Request**: opens a call; the id is chosen by the sending correlator
//! - **Chunk**: zero or more partial result fragments, in send order
//! - **Done / Failed**: exactly one per request, always the last message
//!   bearing that id

use serde::{Deserialize, Serialize};

use crate::actions::Action;

/// Unique identifier for an in-flight request.
///
/// UUID v4 keeps ids unique across every correlator that might share a
/// transport through the relay, without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages exchanged on a transport, in either direction.
///
/// Clients send `Request` and receive the rest; the host dispatcher does the
/// opposite. A relay forwards all of them verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Request {
        id: RequestId,
        #[serde(flatten)]
        action: Action,
    },

    /// Streaming result fragment.
    Chunk { id: RequestId, data: String },

    Done {
        id: RequestId,
        result: serde_json::Value,
    },

    Failed {
        id: RequestId,
        error: String,
    },
}

impl WireMessage {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Request { id, .. }
            | Self::Chunk { id, .. }
            | Self::Done { id, .. }
            | Self::Failed { id, .. } => *id,
        }
    }

    /// True for the message that ends a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }
}
