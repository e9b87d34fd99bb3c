//! HDLC frames and the modulo-8 control field
//!
//! A frame is an optional address octet, a control octet and an optional
//! information field. The control octet is one of three shapes:
//! - Information: `NNNP SSS0`
//! - Supervisory: `NNNP TT01`
//! - Unnumbered: `MMMP MM11`

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Default station address octet
pub const DEFAULT_ADDRESS: u8 = 0x30;

/// Poll / final bit of the control octet
pub const POLL_FINAL: u8 = 0x10;

/// Sequence number modulus
pub const MODULUS: u8 = 8;

/// Errors while interpreting a control octet
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// Selective reject is not part of the supported profile
    #[error("Selective reject not supported")]
    SelectiveReject,

    /// Unnumbered modifier this daemon does not speak
    #[error("Unknown unnumbered frame: {0:#04x}")]
    UnknownUnnumbered(u8),
}

/// Supervisory frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisoryKind {
    /// Receive ready (RR)
    ReceiveReady,
    /// Receive not ready (RNR)
    ReceiveNotReady,
    /// Reject (REJ)
    Reject,
}

impl SupervisoryKind {
    fn bits(self) -> u8 {
        match self {
            Self::ReceiveReady => 0x00,
            Self::ReceiveNotReady => 0x04,
            Self::Reject => 0x08,
        }
    }

    /// Mnemonic
    pub fn name(self) -> &'static str {
        match self {
            Self::ReceiveReady => "RR",
            Self::ReceiveNotReady => "RNR",
            Self::Reject => "REJ",
        }
    }
}

/// Unnumbered frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnnumberedKind {
    /// Set asynchronous balanced mode
    Sabm,
    /// Disconnect
    Disc,
    /// Unnumbered acknowledgment
    Ua,
    /// Disconnected mode
    Dm,
    /// Frame reject
    Frmr,
    /// Unnumbered information
    Ui,
    /// Test
    Test,
}

impl UnnumberedKind {
    const ALL: [UnnumberedKind; 7] = [
        Self::Sabm,
        Self::Disc,
        Self::Ua,
        Self::Dm,
        Self::Frmr,
        Self::Ui,
        Self::Test,
    ];

    fn bits(self) -> u8 {
        match self {
            Self::Sabm => 0x2F,
            Self::Disc => 0x43,
            Self::Ua => 0x63,
            Self::Dm => 0x0F,
            Self::Frmr => 0x87,
            Self::Ui => 0x03,
            Self::Test => 0xE3,
        }
    }

    /// Mnemonic
    pub fn name(self) -> &'static str {
        match self {
            Self::Sabm => "SABM",
            Self::Disc => "DISC",
            Self::Ua => "UA",
            Self::Dm => "DM",
            Self::Frmr => "FRMR",
            Self::Ui => "UI",
            Self::Test => "TEST",
        }
    }
}

/// Decoded control field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Sequenced information frame
    Information {
        /// Send sequence number N(S)
        ns: u8,
        /// Receive sequence number N(R)
        nr: u8,
        /// Poll bit
        poll: bool,
    },
    /// Supervisory frame carrying an acknowledgment
    Supervisory {
        /// Frame type
        kind: SupervisoryKind,
        /// Receive sequence number N(R)
        nr: u8,
        /// Poll / final bit
        poll_final: bool,
    },
    /// Unnumbered frame
    Unnumbered {
        /// Frame type
        kind: UnnumberedKind,
        /// Poll / final bit
        poll_final: bool,
    },
}

impl Control {
    /// Decode a control octet
    pub fn from_octet(octet: u8) -> Result<Self, ControlError> {
        let poll_final = octet & POLL_FINAL != 0;
        if octet & 0x01 == 0 {
            return Ok(Self::Information {
                ns: (octet >> 1) & 0x07,
                nr: octet >> 5,
                poll: poll_final,
            });
        }
        if octet & 0x03 == 0x01 {
            let kind = match octet & 0x0C {
                0x00 => SupervisoryKind::ReceiveReady,
                0x04 => SupervisoryKind::ReceiveNotReady,
                0x08 => SupervisoryKind::Reject,
                _ => return Err(ControlError::SelectiveReject),
            };
            return Ok(Self::Supervisory {
                kind,
                nr: octet >> 5,
                poll_final,
            });
        }
        let modifier = octet & !POLL_FINAL;
        UnnumberedKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.bits() == modifier)
            .map(|kind| Self::Unnumbered { kind, poll_final })
            .ok_or(ControlError::UnknownUnnumbered(octet))
    }

    /// Encode into a control octet
    pub fn to_octet(self) -> u8 {
        match self {
            Self::Information { ns, nr, poll } => {
                ((nr % MODULUS) << 5) | (u8::from(poll) << 4) | ((ns % MODULUS) << 1)
            }
            Self::Supervisory { kind, nr, poll_final } => {
                ((nr % MODULUS) << 5) | (u8::from(poll_final) << 4) | kind.bits() | 0x01
            }
            Self::Unnumbered { kind, poll_final } => kind.bits() | (u8::from(poll_final) << 4),
        }
    }

    /// Poll / final bit regardless of frame shape
    pub fn poll_final(self) -> bool {
        match self {
            Self::Information { poll, .. } => poll,
            Self::Supervisory { poll_final, .. } | Self::Unnumbered { poll_final, .. } => poll_final,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Address octet (absent on address-less links)
    pub address: Option<u8>,
    /// Control field
    pub control: Control,
    /// Information field
    pub payload: Bytes,
}

impl Frame {
    /// Information frame
    pub fn information(address: Option<u8>, ns: u8, nr: u8, payload: Bytes) -> Self {
        Self {
            address,
            control: Control::Information { ns, nr, poll: false },
            payload,
        }
    }

    /// Supervisory frame
    pub fn supervisory(address: Option<u8>, kind: SupervisoryKind, nr: u8, poll_final: bool) -> Self {
        Self {
            address,
            control: Control::Supervisory { kind, nr, poll_final },
            payload: Bytes::new(),
        }
    }

    /// Unnumbered frame without information field
    pub fn unnumbered(address: Option<u8>, kind: UnnumberedKind, poll_final: bool) -> Self {
        Self {
            address,
            control: Control::Unnumbered { kind, poll_final },
            payload: Bytes::new(),
        }
    }

    /// Unnumbered information frame
    pub fn ui(address: Option<u8>, payload: Bytes) -> Self {
        Self {
            address,
            control: Control::Unnumbered {
                kind: UnnumberedKind::Ui,
                poll_final: false,
            },
            payload,
        }
    }

    /// Is this a sequenced information frame?
    pub fn is_information(&self) -> bool {
        matches!(self.control, Control::Information { .. })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(address) = self.address {
            write!(f, "[{address:#04x}] ")?;
        }
        match self.control {
            Control::Information { ns, nr, poll } => {
                write!(f, "I N(S)={ns} N(R)={nr}")?;
                if poll {
                    f.write_str(" P")?;
                }
            }
            Control::Supervisory { kind, nr, poll_final } => {
                write!(f, "{} N(R)={nr}", kind.name())?;
                if poll_final {
                    f.write_str(" P/F")?;
                }
            }
            Control::Unnumbered { kind, poll_final } => {
                f.write_str(kind.name())?;
                if poll_final {
                    f.write_str(" P/F")?;
                }
            }
        }
        if !self.payload.is_empty() {
            write!(f, " len={} {}", self.payload.len(), hex::encode(&self.payload))?;
        }
        Ok(())
    }
}

/// Distance from `from` to `to` going forward modulo 8
pub fn seq_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) % MODULUS
}

/// Next sequence number modulo 8
pub fn seq_next(seq: u8) -> u8 {
    (seq + 1) % MODULUS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unnumbered_octets() {
        let sabm = Control::Unnumbered {
            kind: UnnumberedKind::Sabm,
            poll_final: true,
        };
        assert_eq!(sabm.to_octet(), 0x3F);
        assert_eq!(Control::from_octet(0x3F), Ok(sabm));
        assert_eq!(
            Control::from_octet(0x63),
            Ok(Control::Unnumbered {
                kind: UnnumberedKind::Ua,
                poll_final: false
            })
        );
    }

    #[test]
    fn test_information_octet() {
        let control = Control::Information { ns: 5, nr: 3, poll: false };
        assert_eq!(control.to_octet(), 0b0110_1010);
        assert_eq!(Control::from_octet(0b0110_1010), Ok(control));
    }

    #[test]
    fn test_supervisory_octet() {
        let rej = Control::Supervisory {
            kind: SupervisoryKind::Reject,
            nr: 7,
            poll_final: true,
        };
        assert_eq!(rej.to_octet(), 0xF9);
        assert_eq!(Control::from_octet(0xF9), Ok(rej));
    }

    #[test]
    fn test_rejected_octets() {
        assert_eq!(Control::from_octet(0x0D), Err(ControlError::SelectiveReject));
        assert_eq!(Control::from_octet(0xAF), Err(ControlError::UnknownUnnumbered(0xAF)));
    }

    #[test]
    fn test_sequence_arithmetic() {
        assert_eq!(seq_next(7), 0);
        assert_eq!(seq_distance(6, 1), 3);
        assert_eq!(seq_distance(2, 2), 0);
    }

    #[test]
    fn test_display() {
        let frame = Frame::information(Some(0x30), 1, 2, Bytes::from_static(b"\x01\xab"));
        assert_eq!(frame.to_string(), "[0x30] I N(S)=1 N(R)=2 len=2 01ab");
    }
}
