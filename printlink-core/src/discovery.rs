//! LAN discovery grammar: `"<name>@<ip>|key:value|..."` responses, supported models, device registry.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use tracing::{debug, info};

/// Discovery UDP port every Snapmaker printer listens on.
pub const DISCOVER_PORT: u16 = 20054;
/// Literal broadcast request.
pub const DISCOVER_MESSAGE: &[u8] = b"discover";

/// How a machine family is reached once discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Binary framed protocol over TCP.
    Sacp,
    /// HTTP polling API.
    Http,
}

impl TransportKind {
    /// Transport for a discovered `model` property, if the model is known.
    pub fn for_model(model: &str) -> Option<TransportKind> {
        SUPPORTED_MACHINES
            .iter()
            .find(|m| m.model == model)
            .map(|m| m.transport)
    }
}

/// A supported printer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineModel {
    /// Machine name as shown to users.
    pub name: &'static str,
    /// Value the printer reports in its `model` property.
    pub model: &'static str,
    pub transport: TransportKind,
}

pub const SUPPORTED_MACHINES: &[MachineModel] = &[
    MachineModel {
        name: "Snapmaker J1",
        model: "Snapmaker J1",
        transport: TransportKind::Sacp,
    },
    MachineModel {
        name: "Snapmaker Artisan",
        model: "Snapmaker Artisan",
        transport: TransportKind::Sacp,
    },
    MachineModel {
        name: "Snapmaker 2.0 A150 Dual Extruder",
        model: "Snapmaker 2 Model A150",
        transport: TransportKind::Http,
    },
    MachineModel {
        name: "Snapmaker 2.0 A250 Dual Extruder",
        model: "Snapmaker 2 Model A250",
        transport: TransportKind::Http,
    },
    MachineModel {
        name: "Snapmaker 2.0 A350 Dual Extruder",
        model: "Snapmaker 2 Model A350",
        transport: TransportKind::Http,
    },
];

/// Model identifiers of every supported machine.
pub fn supported_models() -> Vec<String> {
    SUPPORTED_MACHINES.iter().map(|m| m.model.to_string()).collect()
}

/// A printer that answered a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// `"<name>@<ip>"` exactly as announced.
    pub device_id: String,
    pub name: String,
    pub address: String,
    pub properties: BTreeMap<String, String>,
}

impl DiscoveredDevice {
    pub fn model(&self) -> Option<&str> {
        self.properties.get("model").map(String::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.properties.get("status").map(String::as_str)
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.address.parse().ok()
    }

    /// Entry in [`SUPPORTED_MACHINES`] matching the reported model.
    pub fn machine(&self) -> Option<&'static MachineModel> {
        let model = self.model()?;
        SUPPORTED_MACHINES.iter().find(|m| m.model == model)
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.machine().map(|m| m.transport)
    }
}

/// Parse one discovery response. Returns `None` when the first segment carries no `@` or no address.
pub fn parse_response(message: &str) -> Option<DiscoveredDevice> {
    let mut parts = message.split('|');
    let device_id = parts.next()?;
    let (name, address) = device_id.rsplit_once('@')?;
    if address.is_empty() {
        return None;
    }
    let properties = parts
        .filter_map(|part| part.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Some(DiscoveredDevice {
        device_id: device_id.to_string(),
        name: name.to_string(),
        address: address.to_string(),
        properties,
    })
}

/// Parse a raw datagram; non-UTF-8 payloads are dropped.
pub fn parse_datagram(bytes: &[u8]) -> Option<DiscoveredDevice> {
    std::str::from_utf8(bytes).ok().and_then(parse_response)
}

/// Outcome of feeding one datagram to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryUpdate {
    /// First sighting of this device id.
    Added(DiscoveredDevice),
    /// Known device; its record was replaced by the newer datagram.
    Refreshed(DiscoveredDevice),
    /// Malformed, unsupported model, or filtered out.
    Ignored,
}

/// Devices seen this session, keyed by device id. Only supported models are admitted.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    allowed_models: Vec<String>,
    devices: HashMap<String, DiscoveredDevice>,
}

impl DeviceRegistry {
    /// Registry admitting every supported machine.
    pub fn new() -> Self {
        Self::with_models(supported_models())
    }

    /// Registry admitting only `models` (for example, just the active machine).
    pub fn with_models(models: Vec<String>) -> Self {
        Self {
            allowed_models: models,
            devices: HashMap::new(),
        }
    }

    pub fn allowed_models(&self) -> &[String] {
        &self.allowed_models
    }

    /// Feed one received message. Duplicates and reordering are harmless: the key never changes.
    pub fn on_message(&mut self, message: &str) -> RegistryUpdate {
        match parse_response(message) {
            Some(device) => self.admit(device),
            None => {
                debug!(message, "dropping malformed discovery response");
                RegistryUpdate::Ignored
            }
        }
    }

    /// Feed one raw datagram.
    pub fn on_datagram(&mut self, bytes: &[u8]) -> RegistryUpdate {
        match parse_datagram(bytes) {
            Some(device) => self.admit(device),
            None => {
                debug!(bytes = bytes.len(), "dropping malformed discovery datagram");
                RegistryUpdate::Ignored
            }
        }
    }

    fn admit(&mut self, device: DiscoveredDevice) -> RegistryUpdate {
        let model = device.model().unwrap_or_default();
        if !self.allowed_models.iter().any(|m| m == model) {
            debug!(device_id = %device.device_id, model, "dropping unsupported model");
            return RegistryUpdate::Ignored;
        }
        match self.devices.insert(device.device_id.clone(), device.clone()) {
            None => {
                info!(name = %device.name, address = %device.address, model, "discovered printer");
                RegistryUpdate::Added(device)
            }
            Some(_) => RegistryUpdate::Refreshed(device),
        }
    }

    /// Devices sorted by id.
    pub fn devices(&self) -> Vec<&DiscoveredDevice> {
        let mut out: Vec<&DiscoveredDevice> = self.devices.values().collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
