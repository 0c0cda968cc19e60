//! In-band signaling messages exchanged over a fresh connection to pair the
//! gates of both ends.

use serde::{Deserialize, Serialize};

use crate::ll_error::LinkError;
use crate::ll_interface::{GateId, Name, Packet, PacketKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalingMessage {
    /// Asks the peer to build its reverse gate.
    OpenLinkRequest {
        local_attachment_name: Name,
        local_gate_id: GateId,
        #[serde(default)]
        local_routing_name: Option<Name>,
    },
    /// Answer to a request or to an explicit gate request.
    OpenLinkResponse(LinkResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkResponse {
    Accepted {
        gate_id: GateId,
        #[serde(default)]
        routing_name: Option<Name>,
    },
    Rejected {
        error: String,
    },
}

impl SignalingMessage {
    pub fn request(attachment_name: &str, gate_id: GateId, routing_name: Option<Name>) -> Self {
        SignalingMessage::OpenLinkRequest {
            local_attachment_name: attachment_name.to_string(),
            local_gate_id: gate_id,
            local_routing_name: routing_name,
        }
    }

    pub fn accepted(gate_id: GateId, routing_name: Option<Name>) -> Self {
        SignalingMessage::OpenLinkResponse(LinkResponse::Accepted {
            gate_id,
            routing_name,
        })
    }

    pub fn rejected(error: &LinkError) -> Self {
        SignalingMessage::OpenLinkResponse(LinkResponse::Rejected {
            error: error.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::OpenLinkRequest { .. } => "OpenLinkRequest",
            SignalingMessage::OpenLinkResponse(LinkResponse::Accepted { .. }) => "OpenLinkResponse",
            SignalingMessage::OpenLinkResponse(LinkResponse::Rejected { .. }) => "OpenLinkResponse(error)",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SignalingMessage::OpenLinkRequest { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, LinkError> {
        serde_json::to_vec(self).map_err(|e| LinkError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LinkError> {
        serde_json::from_slice(bytes).map_err(|e| LinkError::Malformed(e.to_string()))
    }

    pub fn to_packet(&self) -> Result<Packet, LinkError> {
        Ok(Packet::signaling(self.encode()?))
    }

    /// `None` for packets that do not carry signaling at all.
    pub fn from_packet(packet: &Packet) -> Option<Result<Self, LinkError>> {
        match packet.kind {
            PacketKind::Signaling => Some(Self::decode(&packet.data)),
            _ => None,
        }
    }
}
