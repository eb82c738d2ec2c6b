use serde::Serialize;

use super::{Packet, PacketWriter, Result};

/// Disconnect during the login state (id 0x00): a JSON chat component.
pub const DISCONNECT_PACKET_ID: i32 = 0x00;

#[derive(Serialize)]
struct ChatComponent<'a> {
    text: &'a str,
}

/// Builds the packet that kicks a logging-in client with `reason`.
pub fn disconnect_packet(reason: &str) -> Result<Packet> {
    let json = serde_json::to_string(&ChatComponent { text: reason })?;
    let mut data = Vec::with_capacity(json.len() + 4);
    PacketWriter::new(&mut data).write_string(&json);
    Ok(Packet::new(DISCONNECT_PACKET_ID, data))
}
