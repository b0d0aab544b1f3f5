//! HTTP polling API used by the Snapmaker 2.0 family (`/api/v1` on port 8080).
//!
//! `POST /connect` opens a session and may hand out a token; `GET /status` reports whether the
//! user has accepted the connection on the touchscreen (200), is still being asked (204) or
//! refused (401). Uploads are a single multipart `POST /upload`.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use printlink_core::TransportKind;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{AuthOutcome, Transport, UploadJob};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink};

pub const HTTP_PORT: u16 = 8080;
const API_PREFIX: &str = "/api/v1";
/// Upload body is streamed in pieces of this size; progress is reported per piece.
const UPLOAD_PIECE: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
struct ConnectReply {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusReply {
    #[serde(default)]
    status: Option<String>,
}

pub struct HttpTransport {
    client: Client,
    base: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(ip: IpAddr, port: u16) -> Result<Self> {
        // Printers live on the LAN; never route through a system proxy.
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base: format!("http://{}:{}{}", ip, port, API_PREFIX),
            token: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn form(&self) -> Form {
        Form::new()
            .text("token", self.token.clone().unwrap_or_default())
            .text("_", cache_buster())
    }

    async fn check_status(&mut self) -> Result<AuthOutcome> {
        let token = self.token.clone().unwrap_or_default();
        let resp = self
            .client
            .get(self.url("/status"))
            .query(&[("token", token.as_str()), ("_", cache_buster().as_str())])
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => {
                let reply: StatusReply = json_body(resp).await?;
                Ok(AuthOutcome::Granted {
                    token: self.token.clone(),
                    status: reply.status,
                })
            }
            204 => Ok(AuthOutcome::Pending),
            401 => {
                self.token = None;
                Ok(AuthOutcome::Denied)
            }
            code => Err(Error::Transport(format!("unexpected HTTP {} from /status", code))),
        }
    }
}

/// Query/form cache-buster: current Unix time in seconds.
fn cache_buster() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:.3}", now.as_secs_f64())
}

/// Bodies that fail to parse are treated as empty, the way the firmware's sloppier replies must be.
async fn json_body<T: DeserializeOwned + Default>(resp: Response) -> Result<T> {
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(error = %e, "invalid JSON from device");
        T::default()
    }))
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn authenticate(&mut self, token: Option<&str>) -> Result<AuthOutcome> {
        self.token = token.filter(|t| !t.is_empty()).map(str::to_string);
        let had_token = self.token.is_some();
        let resp = self
            .client
            .post(self.url("/connect"))
            .multipart(self.form())
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => {
                let reply: ConnectReply = json_body(resp).await?;
                if let Some(token) = reply.token.filter(|t| !t.is_empty()) {
                    self.token = Some(token);
                }
                self.check_status().await
            }
            403 if had_token => {
                debug!("cached token expired");
                self.token = None;
                Ok(AuthOutcome::Expired)
            }
            code => Err(Error::Transport(format!(
                "connect refused (HTTP {}); check the touchscreen and try again",
                code
            ))),
        }
    }

    async fn poll_authorization(&mut self) -> Result<AuthOutcome> {
        self.check_status().await
    }

    async fn upload(&mut self, job: &UploadJob, events: &EventSink) -> Result<()> {
        if self.token.is_none() {
            return Err(Error::TransferFailed("no session token".into()));
        }
        let total = job.payload.len() as u64;
        let pieces: Vec<Vec<u8>> = job.payload.chunks(UPLOAD_PIECE).map(<[u8]>::to_vec).collect();
        let sink = events.clone();
        let mut sent = 0u64;
        let body = futures::stream::iter(pieces.into_iter().map(move |piece| {
            sent += piece.len() as u64;
            sink.emit(EventKind::Progress { sent, total });
            Ok::<_, std::io::Error>(piece)
        }));
        let file = Part::stream_with_length(Body::wrap_stream(body), total)
            .file_name(job.filename.clone())
            .mime_str("application/octet-stream")?;
        info!(filename = %job.filename, bytes = total, "starting upload");
        let resp = self
            .client
            .post(self.url("/upload"))
            .multipart(self.form().part("file", file))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            info!(filename = %job.filename, "upload accepted");
            Ok(())
        } else {
            Err(Error::TransferFailed(format!("device answered HTTP {}", status.as_u16())))
        }
    }

    async fn close(&mut self) {
        if self.token.is_some() {
            let sent = self
                .client
                .post(self.url("/disconnect"))
                .multipart(self.form())
                .send()
                .await;
            if let Err(e) = sent {
                debug!(error = %e, "disconnect request failed");
            }
        }
        self.token = None;
    }
}
