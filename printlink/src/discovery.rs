//! LAN discovery: broadcast `discover` from every IPv4 interface, feed responses to the registry.
//!
//! Each interface gets its own probe (Idle -> Bound -> Probing). Responses are read either with
//! ordinary async readiness (`Async`) or, where broadcast replies to an async socket get lost,
//! by a short blocking receive window right after each send (`Collect`). Both hand every datagram
//! to the same registry, so duplicates and reordering are harmless.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use printlink_core::discovery::{DISCOVER_MESSAGE, DISCOVER_PORT};
use printlink_core::{DeviceRegistry, DiscoveredDevice, RegistryUpdate};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest response datagram read.
const RECV_BUF: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveStrategy {
    /// `Collect` on Windows, `Async` elsewhere.
    #[default]
    Auto,
    Async,
    Collect,
}

impl ReceiveStrategy {
    pub fn resolve(self) -> ReceiveStrategy {
        match self {
            ReceiveStrategy::Auto if cfg!(windows) => ReceiveStrategy::Collect,
            ReceiveStrategy::Auto => ReceiveStrategy::Async,
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub port: u16,
    pub interval: Duration,
    pub collect_window: Duration,
    pub strategy: ReceiveStrategy,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: DISCOVER_PORT,
            interval: Duration::from_secs(16),
            collect_window: Duration::from_millis(200),
            strategy: ReceiveStrategy::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Bound,
    Probing,
}

/// Discovery on one interface address.
#[derive(Debug, Clone)]
pub struct Probe {
    pub ip: Ipv4Addr,
    /// Where `discover` is sent: the interface's broadcast address and the discovery port.
    pub target: SocketAddrV4,
    state: ProbeState,
}

impl Probe {
    pub fn new(ip: Ipv4Addr, target: SocketAddrV4) -> Self {
        Self {
            ip,
            target,
            state: ProbeState::Idle,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    fn bind(&mut self) -> io::Result<StdUdpSocket> {
        let socket = StdUdpSocket::bind((self.ip, 0))?;
        socket.set_broadcast(true)?;
        self.state = ProbeState::Bound;
        Ok(socket)
    }
}

/// Directed broadcast address for `ip` within `netmask`.
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// One probe per non-loopback IPv4 interface address.
pub fn local_probes(port: u16) -> Vec<Probe> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "cannot enumerate network interfaces");
            return Vec::new();
        }
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => {
                let broadcast = v4
                    .broadcast
                    .unwrap_or_else(|| broadcast_address(v4.ip, v4.netmask));
                debug!(interface = %iface.name, ip = %v4.ip, %broadcast, "found interface");
                Some(Probe::new(v4.ip, SocketAddrV4::new(broadcast, port)))
            }
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect()
}

pub struct DiscoveryService {
    settings: DiscoverySettings,
    registry: DeviceRegistry,
}

impl DiscoveryService {
    pub fn new(settings: DiscoverySettings, registry: DeviceRegistry) -> Self {
        Self { settings, registry }
    }

    /// Probe every local interface until `cancel` fires. Newly seen devices are sent on `found`.
    pub async fn run(
        self,
        found: mpsc::UnboundedSender<DiscoveredDevice>,
        cancel: CancellationToken,
    ) -> DeviceRegistry {
        let probes = local_probes(self.settings.port);
        self.run_probes(probes, found, cancel).await
    }

    /// Same as [`run`](Self::run) over an explicit set of probes.
    pub async fn run_probes(
        mut self,
        probes: Vec<Probe>,
        found: mpsc::UnboundedSender<DiscoveredDevice>,
        cancel: CancellationToken,
    ) -> DeviceRegistry {
        let strategy = self.settings.strategy.resolve();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut tasks = Vec::new();
        for mut probe in probes {
            let socket = match probe.bind() {
                Ok(s) => s,
                Err(e) => {
                    warn!(ip = %probe.ip, error = %e, "skipping interface");
                    continue;
                }
            };
            info!(ip = %probe.ip, target = %probe.target, ?strategy, "discovering printers");
            let settings = self.settings.clone();
            let tx = tx.clone();
            let cancel = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                let result = match strategy {
                    ReceiveStrategy::Collect => {
                        probe_collect(probe, socket, &settings, tx, cancel).await
                    }
                    _ => probe_async(probe, socket, &settings, tx, cancel).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "discovery probe stopped");
                }
            }));
        }
        drop(tx);
        if tasks.is_empty() {
            warn!("no usable network interface for discovery");
        } else {
            debug!(models = ?self.registry.allowed_models(), "accepting models");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                datagram = rx.recv() => match datagram {
                    Some(bytes) => {
                        if let RegistryUpdate::Added(device) = self.registry.on_datagram(&bytes) {
                            let _ = found.send(device);
                        }
                    }
                    None => break,
                },
            }
        }
        for task in tasks {
            task.abort();
        }
        self.registry
    }
}

async fn probe_async(
    mut probe: Probe,
    socket: StdUdpSocket,
    settings: &DiscoverySettings,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;
    let mut ticker = tokio::time::interval(settings.interval);
    let mut buf = [0u8; RECV_BUF];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                probe.state = ProbeState::Probing;
                if let Err(e) = socket.send_to(DISCOVER_MESSAGE, probe.target).await {
                    debug!(ip = %probe.ip, error = %e, "discover send failed");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    debug!(%from, bytes = n, "discovery response");
                    if tx.send(buf[..n].to_vec()).is_err() {
                        return Ok(());
                    }
                }
                // Windows reports ICMP port-unreachable as a reset on the next receive.
                Err(e) => debug!(ip = %probe.ip, error = %e, "discovery receive failed"),
            },
        }
    }
}

async fn probe_collect(
    mut probe: Probe,
    socket: StdUdpSocket,
    settings: &DiscoverySettings,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let socket = Arc::new(socket);
    let window = settings.collect_window;
    let mut ticker = tokio::time::interval(settings.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        probe.state = ProbeState::Probing;
        let socket = socket.clone();
        let sink = tx.clone();
        let target = probe.target;
        let collected = tokio::task::spawn_blocking(move || collect_once(&socket, target, window, &sink))
            .await
            .map_err(io::Error::other)??;
        debug!(ip = %probe.ip, responses = collected, "collect window closed");
        if tx.is_closed() {
            return Ok(());
        }
    }
}

/// Send `discover` to `target`, then read responses until `window` has elapsed.
fn collect_once(
    socket: &StdUdpSocket,
    target: SocketAddrV4,
    window: Duration,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> io::Result<usize> {
    socket.send_to(DISCOVER_MESSAGE, target)?;
    let deadline = Instant::now() + window;
    let mut buf = [0u8; RECV_BUF];
    let mut count = 0;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        socket.set_read_timeout(Some(left))?;
        match socket.recv_from(&mut buf) {
            Ok((n, _)) => {
                count += 1;
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}
