//! Snapmaker network printing protocol core.
//! Host-driven: no I/O; host feeds bytes and datagrams in, sends what comes back out.

pub mod checksum;
pub mod chunk;
pub mod connection;
pub mod discovery;
pub mod protocol;
pub mod token;
pub mod wire;

pub use chunk::{ChunkError, UploadSession, UploadStep, CHUNK_SIZE};
pub use connection::{AuthPending, ConnectionMachine, ConnectionState, StateError, WriteDecision};
pub use discovery::{
    parse_response, DeviceRegistry, DiscoveredDevice, MachineModel, RegistryUpdate, TransportKind,
};
pub use protocol::{Command, Message};
pub use token::TokenStore;
pub use wire::{
    decode_packet, encode_packet, next_packet, ChecksumPolicy, Packet, PacketDecodeError,
    PacketEncodeError,
};
