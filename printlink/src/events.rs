//! Events a device connection reports to whoever is watching it.

use printlink_core::ConnectionState;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub device_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    StateChanged(ConnectionState),
    /// User must accept the connection on the printer's touchscreen.
    AuthenticationRequested,
    AuthenticationDenied,
    /// Machine status reported by the device (IDLE, RUNNING, PAUSED, STOPPED).
    DeviceStatus(String),
    Progress { sent: u64, total: u64 },
    UploadFinished { filename: String },
    Failed(String),
}

/// Cloneable event sender bound to one device. A dropped receiver is not an error.
#[derive(Debug, Clone)]
pub struct EventSink {
    device_id: String,
    tx: Option<UnboundedSender<ConnectionEvent>>,
}

impl EventSink {
    pub fn new(device_id: impl Into<String>, tx: UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            device_id: device_id.into(),
            tx: Some(tx),
        }
    }

    /// Sink that discards everything.
    pub fn disabled(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            tx: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn emit(&self, kind: EventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ConnectionEvent {
                device_id: self.device_id.clone(),
                kind,
            });
        }
    }
}
