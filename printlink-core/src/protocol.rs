//! SACP command pairs and the typed bodies carried in packet payloads.
//! Integers are little-endian; strings are u16 length-prefixed UTF-8.

use crate::wire::{Packet, ATTR_REQUEST, ATTR_RESPONSE};

/// TCP port SACP devices listen on.
pub const SACP_PORT: u16 = 8888;
/// Sender id used for the host.
pub const HOST_ID: u8 = 0;
/// Receiver id used for the printer controller.
pub const CONTROLLER_ID: u8 = 2;

/// A (command set, command id) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub set: u8,
    pub id: u8,
}

impl Command {
    pub const CONNECT: Command = Command { set: 0x01, id: 0x05 };
    pub const DISCONNECT: Command = Command { set: 0x01, id: 0x06 };
    pub const PREPARE_UPLOAD: Command = Command { set: 0xB0, id: 0x00 };
    pub const CHUNK: Command = Command { set: 0xB0, id: 0x01 };
    pub const UPLOAD_COMPLETE: Command = Command { set: 0xB0, id: 0x02 };

    pub fn of(packet: &Packet) -> Command {
        Command {
            set: packet.command_set,
            id: packet.command_id,
        }
    }
}

/// All SACP bodies this host sends or understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Host -> device handshake: names and an empty or cached token.
    Connect {
        device_name: String,
        client_name: String,
        token: String,
    },
    /// Device -> host handshake result. Status 0 means connected.
    ConnectAck { status: u8, token: String },
    /// Host -> device: end the session.
    Disconnect,
    /// Device -> host disconnect result.
    DisconnectAck { status: u8 },
    /// Host -> device: announce an upload.
    PrepareUpload {
        filename: String,
        total_len: u32,
        chunk_count: u16,
        digest: String,
    },
    /// Device -> host: send me chunk `index`.
    ChunkRequest { digest: String, index: u16 },
    /// Host -> device: chunk bytes.
    ChunkData {
        status: u8,
        digest: String,
        index: u16,
        data: Vec<u8>,
    },
    /// Device -> host: upload finished. Status 0 means success.
    UploadComplete { status: u8 },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Connect { .. } | Message::ConnectAck { .. } => Command::CONNECT,
            Message::Disconnect | Message::DisconnectAck { .. } => Command::DISCONNECT,
            Message::PrepareUpload { .. } => Command::PREPARE_UPLOAD,
            Message::ChunkRequest { .. } | Message::ChunkData { .. } => Command::CHUNK,
            Message::UploadComplete { .. } => Command::UPLOAD_COMPLETE,
        }
    }

    /// Attribute the message travels with: chunk data answers a device request.
    pub fn attribute(&self) -> u8 {
        match self {
            Message::ConnectAck { .. }
            | Message::DisconnectAck { .. }
            | Message::ChunkData { .. } => ATTR_RESPONSE,
            _ => ATTR_REQUEST,
        }
    }

    /// Serialize the body.
    pub fn encode_body(&self) -> Result<Vec<u8>, BodyError> {
        let mut out = Vec::new();
        match self {
            Message::Connect {
                device_name,
                client_name,
                token,
            } => {
                put_str(&mut out, device_name)?;
                put_str(&mut out, client_name)?;
                put_str(&mut out, token)?;
            }
            Message::ConnectAck { status, token } => {
                out.push(*status);
                put_str(&mut out, token)?;
            }
            Message::Disconnect => {}
            Message::DisconnectAck { status } | Message::UploadComplete { status } => {
                out.push(*status);
            }
            Message::PrepareUpload {
                filename,
                total_len,
                chunk_count,
                digest,
            } => {
                put_str(&mut out, filename)?;
                out.extend_from_slice(&total_len.to_le_bytes());
                out.extend_from_slice(&chunk_count.to_le_bytes());
                put_str(&mut out, digest)?;
            }
            Message::ChunkRequest { digest, index } => {
                put_str(&mut out, digest)?;
                out.extend_from_slice(&index.to_le_bytes());
            }
            Message::ChunkData {
                status,
                digest,
                index,
                data,
            } => {
                out.push(*status);
                put_str(&mut out, digest)?;
                out.extend_from_slice(&index.to_le_bytes());
                let len = u16::try_from(data.len()).map_err(|_| BodyError::TooLong(data.len()))?;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(data);
            }
        }
        Ok(out)
    }

    /// Build a packet carrying this message from host to controller.
    pub fn to_packet(&self, sequence: u16) -> Result<Packet, BodyError> {
        let command = self.command();
        Ok(Packet {
            receiver_id: CONTROLLER_ID,
            sender_id: HOST_ID,
            attribute: self.attribute(),
            sequence,
            command_set: command.set,
            command_id: command.id,
            payload: self.encode_body()?,
        })
    }

    /// Parse a packet arriving from the device. Unknown command pairs yield `Ok(None)`.
    pub fn from_device(packet: &Packet) -> Result<Option<Message>, BodyError> {
        let mut r = BodyReader::new(&packet.payload);
        let msg = match Command::of(packet) {
            Command::CONNECT => {
                let status = r.u8()?;
                // Some firmware answers a failed handshake with the status byte alone.
                let token = if r.is_empty() { String::new() } else { r.string()? };
                Message::ConnectAck { status, token }
            }
            Command::DISCONNECT => Message::DisconnectAck {
                status: if r.is_empty() { 0 } else { r.u8()? },
            },
            Command::CHUNK => {
                let digest = r.string()?;
                let index = r.u16()?;
                Message::ChunkRequest { digest, index }
            }
            Command::UPLOAD_COMPLETE => Message::UploadComplete { status: r.u8()? },
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Parse a packet arriving from the host. Used by device-side tooling and tests.
    pub fn from_host(packet: &Packet) -> Result<Option<Message>, BodyError> {
        let mut r = BodyReader::new(&packet.payload);
        let msg = match Command::of(packet) {
            Command::CONNECT => Message::Connect {
                device_name: r.string()?,
                client_name: r.string()?,
                token: r.string()?,
            },
            Command::DISCONNECT => Message::Disconnect,
            Command::PREPARE_UPLOAD => Message::PrepareUpload {
                filename: r.string()?,
                total_len: r.u32()?,
                chunk_count: r.u16()?,
                digest: r.string()?,
            },
            Command::CHUNK => {
                let status = r.u8()?;
                let digest = r.string()?;
                let index = r.u16()?;
                let len = r.u16()? as usize;
                Message::ChunkData {
                    status,
                    digest,
                    index,
                    data: r.bytes(len)?.to_vec(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Error encoding or parsing a message body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("body truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("field of {0} bytes does not fit a u16 length prefix")]
    TooLong(usize),
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), BodyError> {
    let len = u16::try_from(s.len()).map_err(|_| BodyError::TooLong(s.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BodyError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let end = end.ok_or(BodyError::Truncated {
            offset: self.pos,
            needed: n,
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BodyError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BodyError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BodyError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, BodyError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| BodyError::InvalidUtf8)
    }
}
