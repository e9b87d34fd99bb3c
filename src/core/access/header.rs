//! Session header sent by a client right after connecting
//!
//! ```text
//! +---------+-----+----------+------------------+
//! | version | SAP | name len | device name      |
//! |  0x00   |     |   u8     | UTF-8, len bytes |
//! +---------+-----+----------+------------------+
//! ```
//!
//! SAP high nibble selects the session kind, the low bits are delivery
//! filters: `0x02` sent packets, `0x01` received packets. `0x0C` is reserved.

use crate::core::hdlc::packet::{Direction, LinkEvent, Packet};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Only version understood
pub const PROTOCOL_VERSION: u8 = 0x00;

const SAP_PAYLOAD_RW: u8 = 0x00;
const SAP_CONTROL: u8 = 0x10;
const SAP_PAYLOAD_RO: u8 = 0x20;
const SAP_RAW: u8 = 0x30;
const SAP_DISSECTED: u8 = 0x40;
const SAP_KIND_MASK: u8 = 0xF0;
const SAP_RESERVED: u8 = 0x0C;
const SAP_DELIVER_SENT: u8 = 0x02;
const SAP_DELIVER_RECEIVED: u8 = 0x01;

/// Session header errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Version other than [`PROTOCOL_VERSION`]
    #[error("Unsupported session protocol version {0:#04x}")]
    UnsupportedVersion(u8),

    /// Reserved SAP bits set
    #[error("Reserved bits set in SAP {0:#04x}")]
    ReservedBits(u8),

    /// Unknown session kind
    #[error("Unknown service access point {0:#04x}")]
    UnknownService(u8),

    /// Empty or not UTF-8
    #[error("Invalid device name")]
    InvalidDeviceName,

    /// Device name does not fit the length octet
    #[error("Device name too long: {0} bytes, at most 255")]
    DeviceNameTooLong(usize),
}

/// What a session exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    /// Payloads and control packets
    Payload,
    /// Control packets only
    Control,
    /// Raw frames as seen on the line
    Raw,
    /// Frames in human-readable form
    Dissected,
}

impl SessionKind {
    /// Does this kind receive frame traces?
    pub fn wants_frames(self) -> bool {
        matches!(self, Self::Raw | Self::Dissected)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Payload => "payload",
            Self::Control => "control",
            Self::Raw => "raw",
            Self::Dissected => "dissected",
        };
        f.write_str(name)
    }
}

/// May the session change anything on the link?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Submit payloads and reset the port
    ReadWrite,
    /// Observe only
    ReadOnly,
}

impl AccessMode {
    /// Writes allowed?
    pub fn may_write(self) -> bool {
        self == Self::ReadWrite
    }
}

/// Decoded session header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    /// Session kind
    pub kind: SessionKind,
    /// Access mode
    pub access: AccessMode,
    /// Deliver packets and frames sent to the peer
    pub deliver_sent: bool,
    /// Deliver packets and frames received from the peer
    pub deliver_received: bool,
    /// Serial device the session is for
    pub device: String,
}

impl SessionHeader {
    /// Payload session receiving what the peer sends
    pub fn payload(device: impl Into<String>, access: AccessMode) -> Self {
        Self {
            kind: SessionKind::Payload,
            access,
            deliver_sent: false,
            deliver_received: true,
            device: device.into(),
        }
    }

    /// Session of `kind` with the access that kind implies
    pub fn new(device: impl Into<String>, kind: SessionKind) -> Self {
        let access = match kind {
            SessionKind::Payload | SessionKind::Control => AccessMode::ReadWrite,
            SessionKind::Raw | SessionKind::Dissected => AccessMode::ReadOnly,
        };
        Self {
            kind,
            access,
            deliver_sent: true,
            deliver_received: true,
            device: device.into(),
        }
    }

    /// Set the delivery filters
    #[must_use]
    pub fn deliver(mut self, sent: bool, received: bool) -> Self {
        self.deliver_sent = sent;
        self.deliver_received = received;
        self
    }

    /// Service access point octet
    pub fn sap(&self) -> u8 {
        let kind = match (self.kind, self.access) {
            (SessionKind::Payload, AccessMode::ReadWrite) => SAP_PAYLOAD_RW,
            (SessionKind::Payload, AccessMode::ReadOnly) => SAP_PAYLOAD_RO,
            (SessionKind::Control, _) => SAP_CONTROL,
            (SessionKind::Raw, _) => SAP_RAW,
            (SessionKind::Dissected, _) => SAP_DISSECTED,
        };
        let mut sap = kind;
        if self.deliver_sent {
            sap |= SAP_DELIVER_SENT;
        }
        if self.deliver_received {
            sap |= SAP_DELIVER_RECEIVED;
        }
        sap
    }

    /// Rebuild a header from its SAP octet
    pub fn from_sap(sap: u8, device: impl Into<String>) -> Result<Self, HeaderError> {
        if sap & SAP_RESERVED != 0 {
            return Err(HeaderError::ReservedBits(sap));
        }
        let (kind, access) = match sap & SAP_KIND_MASK {
            SAP_PAYLOAD_RW => (SessionKind::Payload, AccessMode::ReadWrite),
            SAP_PAYLOAD_RO => (SessionKind::Payload, AccessMode::ReadOnly),
            SAP_CONTROL => (SessionKind::Control, AccessMode::ReadWrite),
            SAP_RAW => (SessionKind::Raw, AccessMode::ReadOnly),
            SAP_DISSECTED => (SessionKind::Dissected, AccessMode::ReadOnly),
            _ => return Err(HeaderError::UnknownService(sap)),
        };
        Ok(Self {
            kind,
            access,
            deliver_sent: sap & SAP_DELIVER_SENT != 0,
            deliver_received: sap & SAP_DELIVER_RECEIVED != 0,
            device: device.into(),
        })
    }

    /// Append the wire form to `dst`
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), HeaderError> {
        let name = self.device.as_bytes();
        let len = u8::try_from(name.len()).map_err(|_| HeaderError::DeviceNameTooLong(name.len()))?;
        if len == 0 {
            return Err(HeaderError::InvalidDeviceName);
        }
        dst.reserve(3 + name.len());
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.sap());
        dst.put_u8(len);
        dst.put_slice(name);
        Ok(())
    }

    /// Take a complete header off the front of `src`
    ///
    /// `Ok(None)` while more bytes are needed.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, HeaderError> {
        if src.len() < 3 {
            return Ok(None);
        }
        if src[0] != PROTOCOL_VERSION {
            return Err(HeaderError::UnsupportedVersion(src[0]));
        }
        let len = usize::from(src[2]);
        if src.len() < 3 + len {
            return Ok(None);
        }
        let sap = src[1];
        src.advance(3);
        let name = src.split_to(len);
        let device = std::str::from_utf8(&name).map_err(|_| HeaderError::InvalidDeviceName)?;
        if device.is_empty() {
            return Err(HeaderError::InvalidDeviceName);
        }
        Self::from_sap(sap, device).map(Some)
    }

    fn wants_direction(&self, direction: Direction) -> bool {
        match direction {
            Direction::Sent => self.deliver_sent,
            Direction::Received => self.deliver_received,
        }
    }

    /// Should `event` be forwarded to this session?
    pub fn wants(&self, event: &LinkEvent) -> bool {
        match event {
            LinkEvent::Packet(Packet::Control(_)) => true,
            LinkEvent::Packet(Packet::Data(data)) => {
                self.kind == SessionKind::Payload && self.wants_direction(data.direction)
            }
            LinkEvent::Frame(trace) => {
                self.kind.wants_frames() && self.wants_direction(trace.direction)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hdlc::packet::{ControlPacket, DataPacket, FrameTrace};
    use crate::core::hdlc::frame::{Frame, UnnumberedKind};
    use bytes::Bytes;

    #[test]
    fn test_decode_payload_header() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x0C][..]);
        buf.extend_from_slice(b"/dev/ttyUSB0");
        let header = SessionHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(header.kind, SessionKind::Payload);
        assert_eq!(header.access, AccessMode::ReadWrite);
        assert!(header.deliver_received);
        assert!(!header.deliver_sent);
        assert_eq!(header.device, "/dev/ttyUSB0");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial() {
        let mut buf = BytesMut::from(&[0x00, 0x21, 0x04, b't', b't'][..]);
        assert_eq!(SessionHeader::decode(&mut buf), Ok(None));
        buf.extend_from_slice(b"yS");
        let header = SessionHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(header.access, AccessMode::ReadOnly);
        assert_eq!(header.device, "ttyS");
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut buf = BytesMut::from(&[0x01, 0x00, 0x01, b'x'][..]);
        assert_eq!(
            SessionHeader::decode(&mut buf),
            Err(HeaderError::UnsupportedVersion(1))
        );

        let mut buf = BytesMut::from(&[0x00, 0x04, 0x01, b'x'][..]);
        assert_eq!(SessionHeader::decode(&mut buf), Err(HeaderError::ReservedBits(0x04)));

        let mut buf = BytesMut::from(&[0x00, 0x70, 0x01, b'x'][..]);
        assert_eq!(SessionHeader::decode(&mut buf), Err(HeaderError::UnknownService(0x70)));

        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00][..]);
        assert_eq!(SessionHeader::decode(&mut buf), Err(HeaderError::InvalidDeviceName));
    }

    #[test]
    fn test_encode_device_name_limits() {
        let mut buf = BytesMut::new();
        SessionHeader::payload("é".repeat(127), AccessMode::ReadWrite)
            .encode(&mut buf)
            .unwrap();
        assert_eq!(buf[2], 254);
        assert_eq!(SessionHeader::decode(&mut buf).unwrap().unwrap().device, "é".repeat(127));

        // 128 two-byte characters: 256 bytes
        let mut buf = BytesMut::new();
        let long = SessionHeader::payload("é".repeat(128), AccessMode::ReadWrite);
        assert_eq!(long.encode(&mut buf), Err(HeaderError::DeviceNameTooLong(256)));
        assert!(buf.is_empty());

        let empty = SessionHeader::payload("", AccessMode::ReadWrite);
        assert_eq!(empty.encode(&mut buf), Err(HeaderError::InvalidDeviceName));
    }

    #[test]
    fn test_sap_of_kinds() {
        assert_eq!(SessionHeader::new("d", SessionKind::Raw).sap(), 0x33);
        assert_eq!(SessionHeader::new("d", SessionKind::Dissected).deliver(false, true).sap(), 0x41);
        assert_eq!(SessionHeader::new("d", SessionKind::Control).deliver(false, false).sap(), 0x10);
        assert_eq!(SessionHeader::payload("d", AccessMode::ReadOnly).sap(), 0x21);
    }

    #[test]
    fn test_filters() {
        let sent = LinkEvent::Packet(Packet::Data(DataPacket {
            payload: Bytes::from_static(b"x"),
            reliable: true,
            direction: Direction::Sent,
        }));
        let received = LinkEvent::Packet(Packet::Data(DataPacket::received(Bytes::new())));
        let control = LinkEvent::from(ControlPacket::Connected);
        let frame = LinkEvent::Frame(FrameTrace {
            direction: Direction::Received,
            frame: Frame::unnumbered(Some(0x30), UnnumberedKind::Ua, true),
            raw: Bytes::new(),
        });

        let payload = SessionHeader::payload("d", AccessMode::ReadWrite);
        assert!(payload.wants(&received));
        assert!(!payload.wants(&sent));
        assert!(payload.wants(&control));
        assert!(!payload.wants(&frame));

        let control_only = SessionHeader::new("d", SessionKind::Control);
        assert!(!control_only.wants(&received));
        assert!(control_only.wants(&control));

        let raw = SessionHeader::new("d", SessionKind::Raw).deliver(true, false);
        assert!(!raw.wants(&frame));
        assert!(!raw.wants(&received));
    }
}
