//! Serial device ownership
//!
//! - Exclusive device locking across processes
//! - Baud rate selection and probing
//! - The per-device link task and its fan-out to clients
//! - The registry of running links

pub mod baud;
pub mod handler;
pub mod lock;
pub mod recovery;
pub mod registry;

pub use baud::{BaudRate, BaudSelection};
pub use handler::{
    AttachGuard, Attachment, ClientId, LinkCommand, LinkError, LinkHandle, LinkSettings, PortOpener,
    SerialOpener, SerialPortHandler,
};
pub use lock::{LockError, SerialPortLock};
pub use recovery::{Backoff, RecoveryPolicy};
pub use registry::SerialPortHandlerCollection;

/// Serial devices present on this machine
pub fn list_ports() -> std::io::Result<Vec<serialport::SerialPortInfo>> {
    serialport::available_ports().map_err(std::io::Error::from)
}
