//! Client access protocol
//!
//! TCP clients open a session on one device with a short header, then
//! exchange data and control packets with the daemon.

pub mod acceptor;
pub mod client;
pub mod codec;
pub mod header;
pub mod registry;

pub use acceptor::ClientAcceptor;
pub use client::{AliveGuard, ClientHandler, ClientSettings, OverflowPolicy, SessionError};
pub use codec::{Inbound, PacketCodec, SessionCodec, WireError};
pub use header::{AccessMode, HeaderError, SessionHeader, SessionKind};
pub use registry::{ClientHandlerCollection, ClientInfo, SessionTicket};
