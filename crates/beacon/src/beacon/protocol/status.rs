use serde::{Deserialize, Serialize};

use super::{Packet, PacketReader, PacketWriter, ProtocolError, Result};

pub const STATUS_REQUEST_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;
pub const PING_PACKET_ID: i32 = 0x01;

/// Ping and pong carry exactly this many payload bytes.
pub const PING_PAYLOAD_BYTES: usize = 8;

const MAX_STATUS_JSON_BYTES: usize = 32_767;

/// The JSON document behind a Status Response, as the server-list UI expects
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: Version,
    pub players: Players,
    pub description: Description,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Players {
    pub max: i32,
    pub online: i32,
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub text: String,
}

impl StatusResponse {
    pub fn to_packet(&self) -> Result<Packet> {
        let json = serde_json::to_string(self)?;
        let mut data = Vec::with_capacity(json.len() + 4);
        PacketWriter::new(&mut data).write_string(&json);
        Ok(Packet::new(STATUS_RESPONSE_PACKET_ID, data))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.id != STATUS_RESPONSE_PACKET_ID {
            return Err(ProtocolError::UnexpectedPacketId {
                want: STATUS_RESPONSE_PACKET_ID,
                got: packet.id,
            });
        }
        let mut r = PacketReader::new(&packet.data);
        let json = r.read_string(MAX_STATUS_JSON_BYTES)?;
        Ok(serde_json::from_str(json)?)
    }
}

/// A configured status, rendered on demand into a [`StatusResponse`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTemplate {
    pub version_name: String,
    pub protocol_number: i32,
    pub max_players: i32,
    pub players_online: i32,
    pub description: String,
    pub favicon: Option<String>,
    pub sample: Vec<PlayerSample>,
}

impl StatusTemplate {
    pub fn render(&self) -> StatusResponse {
        StatusResponse {
            version: Version {
                name: self.version_name.clone(),
                protocol: self.protocol_number,
            },
            players: Players {
                max: self.max_players,
                online: self.players_online,
                sample: self.sample.clone(),
            },
            description: Description {
                text: self.description.clone(),
            },
            favicon: self.favicon.clone(),
        }
    }
}

/// Validates a Status Request: id 0x00 with an empty body.
pub fn expect_status_request(packet: &Packet) -> Result<()> {
    if packet.id != STATUS_REQUEST_PACKET_ID {
        return Err(ProtocolError::UnexpectedPacketId {
            want: STATUS_REQUEST_PACKET_ID,
            got: packet.id,
        });
    }
    if !packet.data.is_empty() {
        return Err(ProtocolError::OutOfRange {
            field: "status request body",
        });
    }
    Ok(())
}

pub fn status_request() -> Packet {
    Packet::new(STATUS_REQUEST_PACKET_ID, Vec::new())
}

/// Builds the pong for a ping, echoing the 8-byte payload byte-for-byte.
pub fn pong_for(ping: &Packet) -> Result<Packet> {
    if ping.id != PING_PACKET_ID {
        return Err(ProtocolError::UnexpectedPacketId {
            want: PING_PACKET_ID,
            got: ping.id,
        });
    }
    if ping.data.len() != PING_PAYLOAD_BYTES {
        return Err(ProtocolError::OutOfRange {
            field: "ping payload",
        });
    }
    Ok(Packet::new(PING_PACKET_ID, ping.data.clone()))
}
