use super::{Packet, PacketReader, PacketWriter, ProtocolError, Result};

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;

/// Byte cap for the serverAddress string field.
pub const MAX_SERVER_ADDRESS_BYTES: usize = 255;

/// The intent a client declares in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

impl NextState {
    fn from_var_int(v: i32) -> Result<Self> {
        match v {
            1 => Ok(Self::Status),
            2 => Ok(Self::Login),
            _ => Err(ProtocolError::OutOfRange {
                field: "handshake nextState",
            }),
        }
    }

    fn as_var_int(self) -> i32 {
        match self {
            Self::Status => 1,
            Self::Login => 2,
        }
    }
}

/// The first packet of every Minecraft session (id 0x00, handshaking state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBoundHandshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

impl ServerBoundHandshake {
    pub fn unmarshal(packet: &Packet) -> Result<Self> {
        if packet.id != HANDSHAKE_PACKET_ID {
            return Err(ProtocolError::UnexpectedPacketId {
                want: HANDSHAKE_PACKET_ID,
                got: packet.id,
            });
        }

        let mut r = PacketReader::new(&packet.data);
        let protocol_version = r.read_var_int()?;
        let server_address = r.read_string(MAX_SERVER_ADDRESS_BYTES)?.to_owned();
        let server_port = r.read_u16()?;
        let next_state = NextState::from_var_int(r.read_var_int()?)?;

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    pub fn marshal(&self) -> Packet {
        let mut data = Vec::new();
        let mut w = PacketWriter::new(&mut data);
        w.write_var_int(self.protocol_version);
        w.write_string(&self.server_address);
        w.write_u16(self.server_port);
        w.write_var_int(self.next_state.as_var_int());
        Packet::new(HANDSHAKE_PACKET_ID, data)
    }

    /// The hostname used for routing: everything before the first NUL byte
    /// (Forge appends `\0FML\0` markers), lower-cased.
    pub fn routing_key(&self) -> String {
        let host = self
            .server_address
            .split('\0')
            .next()
            .unwrap_or(&self.server_address);
        host.trim().to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(addr: &str, next_state: NextState) -> ServerBoundHandshake {
        ServerBoundHandshake {
            protocol_version: 765,
            server_address: addr.into(),
            server_port: 25565,
            next_state,
        }
    }

    #[test]
    fn marshal_unmarshal_round_trip() {
        let hs = sample("play.example.com", NextState::Login);
        let decoded = ServerBoundHandshake::unmarshal(&hs.marshal()).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn wire_layout_matches_protocol() {
        let hs = sample("mc", NextState::Status);
        let p = hs.marshal();
        // VarInt(765) = 0xfd 0x05, then String("mc"), u16 port, nextState.
        assert_eq!(
            p.data,
            [0xfd, 0x05, 0x02, b'm', b'c', 0x63, 0xdd, 0x01]
        );
    }

    #[test]
    fn rejects_wrong_packet_id() {
        let mut p = sample("x", NextState::Status).marshal();
        p.id = 0x01;
        assert!(matches!(
            ServerBoundHandshake::unmarshal(&p),
            Err(ProtocolError::UnexpectedPacketId { got: 0x01, .. })
        ));
    }

    #[test]
    fn rejects_bad_next_state() {
        let mut data = Vec::new();
        let mut w = PacketWriter::new(&mut data);
        w.write_var_int(765);
        w.write_string("host");
        w.write_u16(25565);
        w.write_var_int(3);
        let p = Packet::new(HANDSHAKE_PACKET_ID, data);
        assert!(matches!(
            ServerBoundHandshake::unmarshal(&p),
            Err(ProtocolError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let full = sample("play.example.com", NextState::Login).marshal();
        let p = Packet::new(HANDSHAKE_PACKET_ID, full.data[..4].to_vec());
        assert!(ServerBoundHandshake::unmarshal(&p).is_err());
    }

    #[test]
    fn routing_key_strips_fml_marker() {
        let hs = sample("foo.example\0FML\0", NextState::Login);
        assert_eq!(hs.routing_key(), "foo.example");
    }

    #[test]
    fn routing_key_is_lower_cased() {
        let hs = sample("Foo.Example", NextState::Status);
        assert_eq!(hs.routing_key(), "foo.example");
    }
}
