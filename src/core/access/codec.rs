//! Client session wire codec
//!
//! After the [`SessionHeader`], both directions carry packets:
//!
//! - Data: type `0x00 | 0x04 reliable | 0x01 was sent`, `u16` big-endian
//!   length, payload. Bits `0x0A` are reserved.
//! - Control: type `0x10`, then a control code. `0x0X` port status
//!   (`0x04` alive, `0x02` connected, `0x01` flow suspended), `0x10` echo,
//!   `0x20` keepalive, `0x30` port reset, `0x40` connected, `0x5R`
//!   disconnected with reason `R`, `0x60` overflow followed by a `u32`
//!   big-endian dropped count.

use super::header::{HeaderError, SessionHeader};
use crate::core::hdlc::packet::{
    ControlPacket, DataPacket, Direction, DisconnectReason, Packet, PortStatus,
};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const TYPE_CONTROL: u8 = 0x10;
const DATA_RELIABLE: u8 = 0x04;
const DATA_WAS_SENT: u8 = 0x01;
const DATA_RESERVED: u8 = 0x0A;

const CTRL_PORT_STATUS: u8 = 0x00;
const CTRL_ECHO: u8 = 0x10;
const CTRL_KEEPALIVE: u8 = 0x20;
const CTRL_PORT_RESET: u8 = 0x30;
const CTRL_CONNECTED: u8 = 0x40;
const CTRL_DISCONNECTED: u8 = 0x50;
const CTRL_OVERFLOW: u8 = 0x60;

const STATUS_ALIVE: u8 = 0x04;
const STATUS_CONNECTED: u8 = 0x02;
const STATUS_FLOW_SUSPENDED: u8 = 0x01;
const STATUS_RESERVED: u8 = 0x08;

/// Largest payload a data packet can carry
pub const MAX_PACKET_PAYLOAD: usize = u16::MAX as usize;

/// Malformed session traffic
#[derive(Error, Debug)]
pub enum WireError {
    /// Socket failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bad session header
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// Packet type octet not understood
    #[error("Unknown packet type {0:#04x}")]
    UnknownType(u8),

    /// Control code not understood
    #[error("Unknown control code {0:#04x}")]
    UnknownControl(u8),

    /// Payload does not fit the length field
    #[error("Payload too large for a packet: {0} bytes")]
    TooLarge(usize),
}

/// Packets in both directions
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        let Some(&kind) = src.first() else {
            return Ok(None);
        };

        if kind == TYPE_CONTROL {
            return decode_control(src);
        }
        if kind & 0xF0 != 0 || kind & DATA_RESERVED != 0 {
            return Err(WireError::UnknownType(kind));
        }
        if src.len() < 3 {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([src[1], src[2]]));
        if src.len() < 3 + len {
            src.reserve(3 + len - src.len());
            return Ok(None);
        }
        src.advance(3);
        let payload = src.split_to(len).freeze();
        let direction = if kind & DATA_WAS_SENT != 0 {
            Direction::Sent
        } else {
            Direction::Received
        };
        Ok(Some(Packet::Data(DataPacket {
            payload,
            reliable: kind & DATA_RELIABLE != 0,
            direction,
        })))
    }
}

fn decode_control(src: &mut BytesMut) -> Result<Option<Packet>, WireError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let code = src[1];
    let control = match code & 0xF0 {
        CTRL_PORT_STATUS if code & STATUS_RESERVED == 0 => ControlPacket::PortStatus(PortStatus {
            alive: code & STATUS_ALIVE != 0,
            connected: code & STATUS_CONNECTED != 0,
            flow_suspended: code & STATUS_FLOW_SUSPENDED != 0,
        }),
        CTRL_ECHO if code == CTRL_ECHO => ControlPacket::Echo,
        CTRL_KEEPALIVE if code == CTRL_KEEPALIVE => ControlPacket::KeepAlive,
        CTRL_PORT_RESET if code == CTRL_PORT_RESET => ControlPacket::PortReset,
        CTRL_CONNECTED if code == CTRL_CONNECTED => ControlPacket::Connected,
        CTRL_DISCONNECTED => match DisconnectReason::from_code(code & 0x0F) {
            Some(reason) => ControlPacket::Disconnected(reason),
            None => return Err(WireError::UnknownControl(code)),
        },
        CTRL_OVERFLOW if code == CTRL_OVERFLOW => {
            if src.len() < 6 {
                return Ok(None);
            }
            let dropped = u32::from_be_bytes([src[2], src[3], src[4], src[5]]);
            src.advance(6);
            return Ok(Some(Packet::Control(ControlPacket::Overflow { dropped })));
        }
        _ => return Err(WireError::UnknownControl(code)),
    };
    src.advance(2);
    Ok(Some(Packet::Control(control)))
}

impl Encoder<Packet> for PacketCodec {
    type Error = WireError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), WireError> {
        match packet {
            Packet::Data(data) => {
                let len = data.payload.len();
                if len > MAX_PACKET_PAYLOAD {
                    return Err(WireError::TooLarge(len));
                }
                let mut kind = 0;
                if data.reliable {
                    kind |= DATA_RELIABLE;
                }
                if data.direction == Direction::Sent {
                    kind |= DATA_WAS_SENT;
                }
                dst.reserve(3 + len);
                dst.put_u8(kind);
                dst.put_u16(len as u16);
                dst.put_slice(&data.payload);
            }
            Packet::Control(control) => {
                dst.reserve(6);
                dst.put_u8(TYPE_CONTROL);
                match control {
                    ControlPacket::PortStatus(status) => {
                        let mut code = CTRL_PORT_STATUS;
                        if status.alive {
                            code |= STATUS_ALIVE;
                        }
                        if status.connected {
                            code |= STATUS_CONNECTED;
                        }
                        if status.flow_suspended {
                            code |= STATUS_FLOW_SUSPENDED;
                        }
                        dst.put_u8(code);
                    }
                    ControlPacket::Echo => dst.put_u8(CTRL_ECHO),
                    ControlPacket::KeepAlive => dst.put_u8(CTRL_KEEPALIVE),
                    ControlPacket::PortReset => dst.put_u8(CTRL_PORT_RESET),
                    ControlPacket::Connected => dst.put_u8(CTRL_CONNECTED),
                    ControlPacket::Disconnected(reason) => {
                        dst.put_u8(CTRL_DISCONNECTED | reason.code())
                    }
                    ControlPacket::Overflow { dropped } => {
                        dst.put_u8(CTRL_OVERFLOW);
                        dst.put_u32(dropped);
                    }
                }
            }
        }
        Ok(())
    }
}

/// What the daemon reads from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// First item of every session
    Header(SessionHeader),
    /// Any later item
    Packet(Packet),
}

/// Daemon side of a session: one header, then packets
#[derive(Debug, Default)]
pub struct SessionCodec {
    header_seen: bool,
    packets: PacketCodec,
}

impl SessionCodec {
    /// Codec expecting a header first
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for SessionCodec {
    type Item = Inbound;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, WireError> {
        if self.header_seen {
            return Ok(self.packets.decode(src)?.map(Inbound::Packet));
        }
        match SessionHeader::decode(src)? {
            Some(header) => {
                self.header_seen = true;
                Ok(Some(Inbound::Header(header)))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for SessionCodec {
    type Error = WireError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), WireError> {
        self.packets.encode(packet, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encoded(packet: Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        PacketCodec.encode(packet, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_data_layout() {
        let packet = Packet::Data(DataPacket {
            payload: Bytes::from_static(b"\x01\x02\x03"),
            reliable: true,
            direction: Direction::Sent,
        });
        assert_eq!(encoded(packet), vec![0x05, 0x00, 0x03, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_control_codes() {
        let status = PortStatus {
            alive: true,
            connected: true,
            flow_suspended: false,
        };
        assert_eq!(encoded(Packet::Control(ControlPacket::PortStatus(status))), vec![0x10, 0x06]);
        assert_eq!(
            encoded(Packet::Control(ControlPacket::Disconnected(DisconnectReason::LinkFailed))),
            vec![0x10, 0x54]
        );
        assert_eq!(
            encoded(Packet::Control(ControlPacket::Overflow { dropped: 258 })),
            vec![0x10, 0x60, 0x00, 0x00, 0x01, 0x02]
        );
    }

    #[test]
    fn test_decode_waits_for_length() {
        let mut buf = BytesMut::from(&[0x04, 0x00, 0x02, 0xAA][..]);
        assert!(PacketCodec.decode(&mut buf).unwrap().is_none());
        buf.put_u8(0xBB);
        buf.extend_from_slice(&[0x10, 0x20]);
        let first = PacketCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Packet::Data(DataPacket::received(Bytes::from_static(b"\xAA\xBB"))));
        let second = PacketCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, Packet::Control(ControlPacket::KeepAlive));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown() {
        let mut buf = BytesMut::from(&[0x08, 0x00, 0x00][..]);
        assert!(matches!(PacketCodec.decode(&mut buf), Err(WireError::UnknownType(0x08))));

        let mut buf = BytesMut::from(&[0x10, 0x70][..]);
        assert!(matches!(PacketCodec.decode(&mut buf), Err(WireError::UnknownControl(0x70))));

        let mut buf = BytesMut::from(&[0x10, 0x5F][..]);
        assert!(matches!(PacketCodec.decode(&mut buf), Err(WireError::UnknownControl(0x5F))));
    }

    #[test]
    fn test_session_codec_header_then_packets() {
        let mut codec = SessionCodec::new();
        let mut buf = BytesMut::new();
        SessionHeader::payload("ttyS0", crate::core::access::header::AccessMode::ReadWrite)
            .encode(&mut buf)
            .unwrap();
        buf.extend_from_slice(&[0x10, 0x10]);

        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Inbound::Header(h)) if h.device == "ttyS0"));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Packet(Packet::Control(ControlPacket::Echo)))
        );
    }
}
