//! Transports a device connection can run over. Each one handles its own handshake and upload;
//! the connection state machine drives them identically.

pub mod http;
pub mod sacp;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use printlink_core::TransportKind;

use crate::config::Config;
use crate::error::Result;
use crate::events::EventSink;

pub use http::HttpTransport;
pub use sacp::SacpTransport;

/// Result of one authentication attempt or poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Session is open. `token` is the one to remember, if the device issued one.
    Granted {
        token: Option<String>,
        status: Option<String>,
    },
    /// Waiting for the user to accept on the touchscreen; poll again later.
    Pending,
    Denied,
    /// The cached token was refused; retry without it.
    Expired,
}

/// A file to send.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub filename: String,
    pub payload: Vec<u8>,
}

impl UploadJob {
    pub fn new(filename: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            payload,
        }
    }

    /// Device-side filename for a print job: `<job>_<materials>_<H>h<M>m<S>s.gcode`.
    pub fn filename_for(job: &str, materials: &str, print_time: Duration) -> String {
        let secs = print_time.as_secs();
        format!(
            "{}_{}_{}h{}m{}s.gcode",
            job,
            materials,
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Establish the underlying channel (TCP connect; nothing for HTTP).
    async fn open(&mut self) -> Result<()>;

    /// First handshake, with the cached token if any.
    async fn authenticate(&mut self, token: Option<&str>) -> Result<AuthOutcome>;

    /// Re-check a pending authorization.
    async fn poll_authorization(&mut self) -> Result<AuthOutcome>;

    async fn upload(&mut self, job: &UploadJob, events: &EventSink) -> Result<()>;

    /// End the session. Best effort; never fails.
    async fn close(&mut self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn authenticate(&mut self, token: Option<&str>) -> Result<AuthOutcome> {
        (**self).authenticate(token).await
    }

    async fn poll_authorization(&mut self) -> Result<AuthOutcome> {
        (**self).poll_authorization().await
    }

    async fn upload(&mut self, job: &UploadJob, events: &EventSink) -> Result<()> {
        (**self).upload(job, events).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

/// Transport for a printer of the given family at `ip`.
pub fn for_device(kind: TransportKind, ip: IpAddr, config: &Config) -> Result<Box<dyn Transport>> {
    Ok(match kind {
        TransportKind::Sacp => Box::new(SacpTransport::new(
            ip,
            sacp::SacpSettings {
                port: config.sacp_port,
                policy: config.checksum_policy,
                chunk_timeout: config.chunk_timeout(),
                device_name: config.device_name.clone(),
                client_name: config.client_name.clone(),
            },
        )),
        TransportKind::Http => Box::new(HttpTransport::new(ip, config.http_port)?),
    })
}
