//! Chunked upload: announce a payload, serve whatever chunk the device asks for, finish on its verdict.

use tracing::{debug, warn};

use crate::checksum::payload_digest;
use crate::protocol::{BodyError, Command, Message};
use crate::wire::Packet;

/// Fixed upload chunk size (60 KiB).
pub const CHUNK_SIZE: usize = 60 * 1024;

/// Number of chunks needed for `total_len` bytes. An empty payload still announces one chunk.
pub fn chunk_count(total_len: usize, chunk_size: usize) -> usize {
    let size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };
    total_len.div_ceil(size).max(1)
}

/// State of one in-flight transfer. Discarded when the transfer finishes or fails.
#[derive(Debug)]
pub struct UploadSession {
    filename: String,
    payload: Vec<u8>,
    digest: String,
    chunk_size: usize,
    chunk_count: usize,
    next_expected_index: usize,
    bytes_served: usize,
}

/// What the host should do after feeding a device packet to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum UploadStep {
    /// Send this packet back to the device.
    Reply(Packet),
    /// The device accepted the upload.
    Finished,
    /// Not part of the upload exchange.
    Ignored,
}

impl UploadSession {
    pub fn new(filename: impl Into<String>, payload: Vec<u8>) -> Result<Self, ChunkError> {
        Self::with_chunk_size(filename, payload, CHUNK_SIZE)
    }

    pub fn with_chunk_size(
        filename: impl Into<String>,
        payload: Vec<u8>,
        chunk_size: usize,
    ) -> Result<Self, ChunkError> {
        let chunk_size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };
        if u32::try_from(payload.len()).is_err() {
            return Err(ChunkError::PayloadTooLarge(payload.len()));
        }
        let chunk_count = chunk_count(payload.len(), chunk_size);
        if u16::try_from(chunk_count).is_err() {
            return Err(ChunkError::PayloadTooLarge(payload.len()));
        }
        let digest = payload_digest(&payload);
        Ok(Self {
            filename: filename.into(),
            payload,
            digest,
            chunk_size,
            chunk_count,
            next_expected_index: 0,
            bytes_served: 0,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn total_len(&self) -> usize {
        self.payload.len()
    }

    /// Index following the most recently served chunk.
    pub fn next_expected_index(&self) -> usize {
        self.next_expected_index
    }

    /// Bytes handed to the device so far (re-served chunks count again).
    pub fn bytes_served(&self) -> usize {
        self.bytes_served
    }

    /// The announce message that opens the exchange.
    pub fn prepare_message(&self) -> Message {
        Message::PrepareUpload {
            filename: self.filename.clone(),
            total_len: self.payload.len() as u32,
            chunk_count: self.chunk_count as u16,
            digest: self.digest.clone(),
        }
    }

    /// Bytes of chunk `index`, clipped to the payload end for the final chunk.
    pub fn chunk(&self, index: usize) -> Result<&[u8], ChunkError> {
        if index >= self.chunk_count {
            return Err(ChunkError::IndexOutOfRange {
                index,
                chunk_count: self.chunk_count,
            });
        }
        let start = (index * self.chunk_size).min(self.payload.len());
        let end = (start + self.chunk_size).min(self.payload.len());
        Ok(&self.payload[start..end])
    }

    /// Answer a device chunk request. Indices may arrive in any order.
    pub fn on_chunk_request(&mut self, digest: &str, index: u16) -> Result<Message, ChunkError> {
        if digest != self.digest {
            return Err(ChunkError::DigestMismatch {
                expected: self.digest.clone(),
                got: digest.to_string(),
            });
        }
        let index = usize::from(index);
        let data = self.chunk(index)?.to_vec();
        if index != self.next_expected_index {
            debug!(index, expected = self.next_expected_index, "out-of-order chunk request");
        }
        self.next_expected_index = index + 1;
        self.bytes_served += data.len();
        Ok(Message::ChunkData {
            status: 0,
            digest: self.digest.clone(),
            index: index as u16,
            data,
        })
    }

    /// Feed one device packet. Chunk replies reuse the request's sequence number.
    ///
    /// Only chunk requests and the completion verdict are read; any other packet, or one of
    /// those with a malformed body, is dropped.
    pub fn handle(&mut self, packet: &Packet) -> Result<UploadStep, ChunkError> {
        let command = Command::of(packet);
        if command != Command::CHUNK && command != Command::UPLOAD_COMPLETE {
            return Ok(UploadStep::Ignored);
        }
        let message = match Message::from_device(packet) {
            Ok(message) => message,
            Err(e) => {
                warn!(?command, error = %e, "dropping malformed upload packet");
                return Ok(UploadStep::Ignored);
            }
        };
        match message {
            Some(Message::ChunkRequest { digest, index }) => {
                let reply = self.on_chunk_request(&digest, index)?;
                Ok(UploadStep::Reply(reply.to_packet(packet.sequence)?))
            }
            Some(Message::UploadComplete { status: 0 }) => Ok(UploadStep::Finished),
            Some(Message::UploadComplete { status }) => {
                warn!(status, filename = %self.filename, "device rejected upload");
                Err(ChunkError::Rejected(status))
            }
            _ => Ok(UploadStep::Ignored),
        }
    }
}

/// Error driving an upload session.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("payload of {0} bytes is too large for one upload")]
    PayloadTooLarge(usize),
    #[error("chunk {index} requested but upload has {chunk_count} chunks")]
    IndexOutOfRange { index: usize, chunk_count: usize },
    #[error("chunk requested for digest {got}, uploading {expected}")]
    DigestMismatch { expected: String, got: String },
    #[error("device reported upload failure (status {0})")]
    Rejected(u8),
    #[error("malformed upload message: {0}")]
    Body(#[from] BodyError),
}
