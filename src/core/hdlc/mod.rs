//! HDLC link layer
//!
//! - Frame codec: delimiting, byte stuffing and FCS-16
//! - Control field model for I-, S- and U-frames
//! - Go-back-N protocol state machine with T1 / N2 recovery
//! - Packet endpoint driving the state machine over a byte stream

pub mod alive;
pub mod codec;
pub mod endpoint;
pub mod fcs;
pub mod frame;
pub mod packet;
pub mod protocol;

pub use codec::{DiscardReason, FrameGenerator, FrameParser, ParseResult};
pub use endpoint::{EndpointError, PacketEndpoint};
pub use frame::{Control, Frame, SupervisoryKind, UnnumberedKind};
pub use packet::{
    ControlPacket, DataPacket, Direction, DisconnectReason, FrameTrace, LinkEvent, Packet, PortStatus,
};
pub use protocol::{LinkProfile, LinkState, ProtocolState, SubmitError};
