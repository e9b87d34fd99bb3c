//! # hdlcd Core Library
//!
//! Shares one reliable HDLC link over a serial device with many TCP clients:
//! - HDLC frame codec (byte stuffing, FCS-16)
//! - Go-back-N link protocol with retransmission and keepalive
//! - Exclusive device locking and automatic reopen
//! - Fan-out of received payloads and link events to every attached client
//!
//! ## Example
//!
//! ```rust,no_run
//! use hdlcd_core::core::access::AccessMode;
//! use hdlcd_core::core::serial::{
//!     Attachment, ClientId, LinkSettings, SerialOpener, SerialPortHandlerCollection,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let links = SerialPortHandlerCollection::new("/var/lock", CancellationToken::new());
//!     let link = links.start(LinkSettings::new("/dev/ttyUSB0"), SerialOpener)?;
//!
//!     let attachment = Attachment { access: AccessMode::ReadOnly, wants_frames: false };
//!     let mut guard = link.attach(ClientId::new(), attachment)?;
//!     while let Ok(event) = guard.events().recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, StartupError};
pub use crate::config::{ConfigError, DaemonConfig};
pub use crate::core::access::{ClientAcceptor, ClientHandlerCollection, SessionHeader, SessionKind};
pub use crate::core::hdlc::{ControlPacket, DataPacket, LinkEvent, Packet, PortStatus};
pub use crate::core::serial::{LinkHandle, LinkSettings, SerialPortHandlerCollection};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
