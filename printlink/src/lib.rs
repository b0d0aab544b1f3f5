//! Host side of the Snapmaker network protocols: discovery sockets, SACP and HTTP transports,
//! and the per-device connection actor.

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod tokens;
pub mod transport;

#[cfg(test)]
mod testing;

pub use device::{ConnectionSettings, DeviceConnection, DeviceHandle, WriteTicket};
pub use error::{Error, Result};
pub use events::{ConnectionEvent, EventKind, EventSink};
