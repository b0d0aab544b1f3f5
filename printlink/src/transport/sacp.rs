//! SACP over TCP: binary handshake, then the device pulls chunks until it reports completion.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use printlink_core::protocol::SACP_PORT;
use printlink_core::wire::PacketDecodeError;
use printlink_core::{
    encode_packet, next_packet, ChecksumPolicy, Message, Packet, TransportKind, UploadSession,
    UploadStep,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{AuthOutcome, Transport, UploadJob};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink};

const READ_BUF: usize = 8192;

#[derive(Debug, Clone)]
pub struct SacpSettings {
    pub port: u16,
    pub policy: ChecksumPolicy,
    /// Longest silence tolerated between device packets during a transfer.
    pub chunk_timeout: Option<Duration>,
    pub device_name: String,
    pub client_name: String,
}

impl Default for SacpSettings {
    fn default() -> Self {
        Self {
            port: SACP_PORT,
            policy: ChecksumPolicy::default(),
            chunk_timeout: Some(Duration::from_secs(30)),
            device_name: "Desktop".to_string(),
            client_name: "printlink".to_string(),
        }
    }
}

pub struct SacpTransport {
    addr: SocketAddr,
    settings: SacpSettings,
    stream: Option<TcpStream>,
    buf: Vec<u8>,
    sequence: u16,
    /// Token sent with the last handshake, echoed back if the device grants without issuing one.
    offered_token: Option<String>,
}

impl SacpTransport {
    pub fn new(ip: IpAddr, settings: SacpSettings) -> Self {
        Self {
            addr: SocketAddr::new(ip, settings.port),
            settings,
            stream: None,
            buf: Vec::new(),
            sequence: 0,
            offered_token: None,
        }
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        let sequence = self.next_sequence();
        let packet = msg.to_packet(sequence)?;
        self.send_packet(&packet).await
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = encode_packet(packet)?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Next whole packet from the stream. `Ok(None)` when `timeout` expires first.
    /// Malformed bytes are dropped one at a time until the stream resynchronizes.
    async fn recv_packet(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>> {
        loop {
            match next_packet(&self.buf, self.settings.policy) {
                Ok((packet, consumed)) => {
                    self.buf.drain(..consumed);
                    return Ok(Some(packet));
                }
                Err(PacketDecodeError::NeedMore) => {}
                Err(e) => {
                    debug!(error = %e, "dropping byte to resynchronize");
                    self.buf.drain(..1);
                    continue;
                }
            }
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::Transport("not connected".into()))?;
            let mut chunk = [0u8; READ_BUF];
            let n = match timeout {
                Some(t) => match tokio::time::timeout(t, stream.read(&mut chunk)).await {
                    Ok(read) => read?,
                    Err(_) => return Ok(None),
                },
                None => stream.read(&mut chunk).await?,
            };
            if n == 0 {
                return Err(Error::Transport("connection closed by device".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn await_connect_ack(&mut self) -> Result<AuthOutcome> {
        loop {
            let Some(packet) = self.recv_packet(None).await? else {
                continue;
            };
            let message = match Message::from_device(&packet) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "dropping malformed packet during handshake");
                    continue;
                }
            };
            match message {
                Some(Message::ConnectAck { status: 0, token }) => {
                    let token = if token.is_empty() {
                        self.offered_token.clone()
                    } else {
                        Some(token)
                    };
                    return Ok(AuthOutcome::Granted {
                        token,
                        status: None,
                    });
                }
                Some(Message::ConnectAck { status, .. }) => {
                    warn!(status, addr = %self.addr, "handshake refused");
                    // A refused cached token gets one retry without it.
                    return Ok(if self.offered_token.is_some() {
                        AuthOutcome::Expired
                    } else {
                        AuthOutcome::Denied
                    });
                }
                other => debug!(?other, "ignoring packet during handshake"),
            }
        }
    }
}

#[async_trait]
impl Transport for SacpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sacp
    }

    async fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.buf.clear();
        debug!(addr = %self.addr, "tcp connected");
        Ok(())
    }

    async fn authenticate(&mut self, token: Option<&str>) -> Result<AuthOutcome> {
        self.offered_token = token.filter(|t| !t.is_empty()).map(str::to_string);
        let hello = Message::Connect {
            device_name: self.settings.device_name.clone(),
            client_name: self.settings.client_name.clone(),
            token: self.offered_token.clone().unwrap_or_default(),
        };
        self.send(&hello).await?;
        self.await_connect_ack().await
    }

    async fn poll_authorization(&mut self) -> Result<AuthOutcome> {
        self.await_connect_ack().await
    }

    async fn upload(&mut self, job: &UploadJob, events: &EventSink) -> Result<()> {
        let mut session = UploadSession::new(job.filename.clone(), job.payload.clone())?;
        let total = session.total_len() as u64;
        info!(
            filename = %session.filename(),
            bytes = total,
            chunks = session.chunk_count(),
            "starting upload"
        );
        self.send(&session.prepare_message()).await?;
        loop {
            let Some(packet) = self.recv_packet(self.settings.chunk_timeout).await? else {
                return Err(Error::TransferFailed("device stopped requesting chunks".into()));
            };
            match session.handle(&packet)? {
                UploadStep::Reply(reply) => {
                    self.send_packet(&reply).await?;
                    events.emit(EventKind::Progress {
                        sent: (session.bytes_served() as u64).min(total),
                        total,
                    });
                }
                UploadStep::Finished => {
                    info!(filename = %session.filename(), "upload accepted");
                    return Ok(());
                }
                UploadStep::Ignored => debug!(command = ?packet.command(), "ignoring packet during upload"),
            }
        }
    }

    async fn close(&mut self) {
        if self.stream.is_some() {
            let _ = self.send(&Message::Disconnect).await;
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printlink_core::checksum::{header_checksum, payload_digest};
    use printlink_core::protocol::Command;
    use printlink_core::CHUNK_SIZE;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::testing::FakeSacpDevice as FakeDevice;

    async fn listener() -> (TcpListener, SacpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = SacpSettings {
            port: addr.port(),
            chunk_timeout: Some(Duration::from_millis(200)),
            ..SacpSettings::default()
        };
        (listener, SacpTransport::new(addr.ip(), settings))
    }

    #[tokio::test]
    async fn handshake_and_out_of_order_upload() {
        let (listener, mut transport) = listener().await;
        let payload: Vec<u8> = (0..CHUNK_SIZE * 2 + 500).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();

        let device = tokio::spawn(async move {
            let mut dev = FakeDevice::accept(&listener).await;
            let (_, hello) = dev.recv().await;
            assert_eq!(
                hello,
                Message::Connect {
                    device_name: "Desktop".into(),
                    client_name: "printlink".into(),
                    token: String::new(),
                }
            );
            // Line noise before the answer must not break framing.
            dev.stream.write_all(&[0x00, 0x13, 0xAA]).await.unwrap();
            dev.send(Message::ConnectAck { status: 0, token: "tok-1".into() }, 1).await;

            let (_, prepare) = dev.recv().await;
            let Message::PrepareUpload { chunk_count, digest, total_len, .. } = prepare else {
                panic!("expected prepare, got {:?}", prepare);
            };
            assert_eq!(chunk_count, 3);
            assert_eq!(total_len as usize, expected.len());

            let mut chunks = vec![Vec::new(); 3];
            for (seq, index) in [(10u16, 2u16), (11, 0), (12, 1)] {
                dev.send(Message::ChunkRequest { digest: digest.clone(), index }, seq).await;
                let (packet, msg) = dev.recv().await;
                assert_eq!(packet.sequence, seq);
                let Message::ChunkData { index: got, data, .. } = msg else {
                    panic!("expected chunk data");
                };
                assert_eq!(got, index);
                chunks[index as usize] = data;
            }
            let rebuilt = chunks.concat();
            assert_eq!(rebuilt, expected);
            assert_eq!(payload_digest(&rebuilt), digest);
            dev.send(Message::UploadComplete { status: 0 }, 13).await;

            let (_, bye) = dev.recv().await;
            assert_eq!(bye, Message::Disconnect);
        });

        transport.open().await.unwrap();
        let outcome = transport.authenticate(None).await.unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Granted {
                token: Some("tok-1".into()),
                status: None
            }
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = EventSink::new("J1@127.0.0.1", tx);
        let total = payload.len() as u64;
        transport
            .upload(&UploadJob::new("part.gcode", payload), &events)
            .await
            .unwrap();
        transport.close().await;
        device.await.unwrap();

        let mut progress = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let EventKind::Progress { sent, total: t } = ev.kind {
                assert_eq!(t, total);
                progress.push(sent);
            }
        }
        assert_eq!(progress.len(), 3);
        assert_eq!(progress.last().copied(), Some(total));
    }

    #[tokio::test]
    async fn non_zero_completion_fails_transfer() {
        let (listener, mut transport) = listener().await;
        let device = tokio::spawn(async move {
            let mut dev = FakeDevice::accept(&listener).await;
            let _ = dev.recv().await;
            dev.send(Message::ConnectAck { status: 0, token: String::new() }, 1).await;
            let _ = dev.recv().await;
            dev.send(Message::UploadComplete { status: 4 }, 2).await;
        });

        transport.open().await.unwrap();
        let outcome = transport.authenticate(Some("cached")).await.unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Granted {
                token: Some("cached".into()),
                status: None
            }
        );
        let err = transport
            .upload(&UploadJob::new("f.gcode", b"G28\n".to_vec()), &EventSink::disabled("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferFailed(_)));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (listener, mut transport) = listener().await;
        let device = tokio::spawn(async move {
            let mut dev = FakeDevice::accept(&listener).await;
            let _ = dev.recv().await;
            dev.send(Message::ConnectAck { status: 0, token: String::new() }, 1).await;
            let _ = dev.recv().await;
            // Hold the socket open without requesting anything.
            tokio::time::sleep(Duration::from_millis(600)).await;
        });

        transport.open().await.unwrap();
        transport.authenticate(None).await.unwrap();
        let err = transport
            .upload(&UploadJob::new("f.gcode", b"G28\n".to_vec()), &EventSink::disabled("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferFailed(_)));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn refused_handshake() {
        let (listener, mut transport) = listener().await;
        let device = tokio::spawn(async move {
            let mut dev = FakeDevice::accept(&listener).await;
            let _ = dev.recv().await;
            dev.send(Message::ConnectAck { status: 1, token: String::new() }, 1).await;
            let _ = dev.recv().await;
            dev.send(Message::ConnectAck { status: 1, token: String::new() }, 2).await;
        });

        transport.open().await.unwrap();
        assert_eq!(transport.authenticate(Some("stale")).await.unwrap(), AuthOutcome::Expired);
        assert_eq!(transport.authenticate(None).await.unwrap(), AuthOutcome::Denied);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn device_hangup_is_a_transport_error() {
        let (listener, mut transport) = listener().await;
        let device = tokio::spawn(async move {
            let dev = FakeDevice::accept(&listener).await;
            drop(dev);
        });
        transport.open().await.unwrap();
        device.await.unwrap();
        let err = transport.authenticate(None).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn corrupt_header_does_not_stall_handshake() {
        let (listener, mut transport) = listener().await;
        let device = tokio::spawn(async move {
            let mut dev = FakeDevice::accept(&listener).await;
            let _ = dev.recv().await;
            // Claims a 64 KiB body but its CRC is wrong.
            let mut bogus = vec![0xAA, 0x55, 0xFF, 0xFF, 0x01, 0x02, 0x00];
            bogus[6] = header_checksum(&bogus, 6) ^ 0xFF;
            dev.stream.write_all(&bogus).await.unwrap();
            dev.send(Message::ConnectAck { status: 0, token: "tok-2".into() }, 1).await;
        });

        transport.open().await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), transport.authenticate(None))
            .await
            .expect("handshake stalled behind a corrupt header")
            .unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Granted {
                token: Some("tok-2".into()),
                status: None
            }
        );
        device.await.unwrap();
    }

    #[tokio::test]
    async fn stray_packets_during_upload_are_dropped() {
        let (listener, mut transport) = listener().await;
        let device = tokio::spawn(async move {
            let mut dev = FakeDevice::accept(&listener).await;
            let _ = dev.recv().await;
            dev.send(Message::ConnectAck { status: 0, token: String::new() }, 1).await;
            let (_, prepare) = dev.recv().await;
            let Message::PrepareUpload { digest, .. } = prepare else {
                panic!("expected prepare, got {:?}", prepare);
            };
            for command in [Command::CONNECT, Command::DISCONNECT] {
                let stray = Packet {
                    receiver_id: 0,
                    sender_id: 2,
                    attribute: 0,
                    sequence: 5,
                    command_set: command.set,
                    command_id: command.id,
                    payload: Vec::new(),
                };
                dev.stream.write_all(&encode_packet(&stray).unwrap()).await.unwrap();
            }
            dev.send(Message::ChunkRequest { digest, index: 0 }, 6).await;
            let (_, data) = dev.recv().await;
            assert!(matches!(data, Message::ChunkData { index: 0, .. }));
            dev.send(Message::UploadComplete { status: 0 }, 7).await;
        });

        transport.open().await.unwrap();
        transport.authenticate(None).await.unwrap();
        transport
            .upload(&UploadJob::new("f.gcode", b"G28\n".to_vec()), &EventSink::disabled("x"))
            .await
            .unwrap();
        device.await.unwrap();
    }
}
