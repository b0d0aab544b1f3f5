// printlink: find Snapmaker printers on the LAN and send G-code to them.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use printlink::config::{self, Config};
use printlink::discovery::DiscoveryService;
use printlink::transport::{self, UploadJob};
use printlink::{tokens, ConnectionEvent, DeviceConnection, EventKind, EventSink};
use printlink_core::{DeviceRegistry, DiscoveredDevice, TokenStore, TransportKind};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "printlink", version, about = "Discover Snapmaker printers and send G-code to them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for printers answering discovery broadcasts
    Discover {
        /// How long to listen
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        /// Only report this model (e.g. "Snapmaker J1")
        #[arg(long)]
        model: Option<String>,
    },
    /// Send a G-code file to a printer
    Send {
        ip: IpAddr,
        file: PathBuf,
        /// Printer model; skips discovery when given
        #[arg(long)]
        model: Option<String>,
        /// Filename shown on the printer (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
        /// Material names for the `<job>_<materials>_<time>.gcode` naming scheme
        #[arg(long)]
        materials: Option<String>,
        /// Estimated print time in seconds, used with --materials
        #[arg(long, default_value_t = 0)]
        print_time: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("printlink=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        match cli.command {
            Commands::Discover { seconds, model } => discover(&cfg, seconds, model).await,
            Commands::Send {
                ip,
                file,
                model,
                name,
                materials,
                print_time,
            } => {
                let filename = match (name, materials) {
                    (Some(name), _) => name,
                    (None, Some(materials)) => {
                        let job = file
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "job".to_string());
                        UploadJob::filename_for(&job, &materials, Duration::from_secs(print_time))
                    }
                    (None, None) => file
                        .file_name()
                        .map(|s| s.to_string_lossy().into_owned())
                        .ok_or_else(|| anyhow!("{} is not a file", file.display()))?,
                };
                send(&cfg, ip, file, model, filename).await
            }
        }
    })
}

fn registry_for(cfg: &Config, model: Option<String>) -> DeviceRegistry {
    match model {
        Some(m) => DeviceRegistry::with_models(vec![m]),
        None => DeviceRegistry::with_models(cfg.supported_models.clone()),
    }
}

/// Run discovery for `window`, calling `on_found` for each new device. Ctrl+C ends early.
async fn run_discovery(
    cfg: &Config,
    registry: DeviceRegistry,
    window: Duration,
    mut on_found: impl FnMut(&DiscoveredDevice) -> bool,
) -> DeviceRegistry {
    let cancel = CancellationToken::new();
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let service = DiscoveryService::new(cfg.discovery(), registry);
    let run = tokio::spawn(service.run(found_tx, cancel.clone()));
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = shutdown_signal() => break,
            found = found_rx.recv() => match found {
                Some(device) => {
                    if !on_found(&device) {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    cancel.cancel();
    run.await.unwrap_or_default()
}

async fn discover(cfg: &Config, seconds: u64, model: Option<String>) -> Result<()> {
    let registry = registry_for(cfg, model);
    let registry = run_discovery(cfg, registry, Duration::from_secs(seconds), |device| {
        tracing::debug!(device_id = %device.device_id, "printer answered");
        true
    })
    .await;
    if registry.is_empty() {
        println!("No printers found.");
        return Ok(());
    }
    for device in registry.devices() {
        println!(
            "{:<32} {:<34} {:<8} {}",
            device.device_id,
            device.machine().map(|m| m.name).unwrap_or("?"),
            device.status().unwrap_or("?"),
            transport_name(device.transport()),
        );
    }
    Ok(())
}

fn transport_name(kind: Option<TransportKind>) -> &'static str {
    match kind {
        Some(TransportKind::Sacp) => "sacp",
        Some(TransportKind::Http) => "http",
        None => "-",
    }
}

/// Device id and transport for the printer at `ip`, from `--model` or a discovery round.
async fn resolve_target(
    cfg: &Config,
    ip: IpAddr,
    model: Option<String>,
) -> Result<(String, TransportKind)> {
    if let Some(model) = model {
        let kind = TransportKind::for_model(&model)
            .ok_or_else(|| anyhow!("unsupported model {:?}", model))?;
        return Ok((format!("{}@{}", model, ip), kind));
    }
    let mut target = None;
    run_discovery(cfg, registry_for(cfg, None), cfg.discovery().interval, |device| {
        if device.ip().map(IpAddr::V4) == Some(ip) {
            target = Some(device.clone());
            return false;
        }
        true
    })
    .await;
    let device = target.ok_or_else(|| {
        anyhow!("no supported printer answered at {}; pass --model to skip discovery", ip)
    })?;
    let kind = device
        .transport()
        .ok_or_else(|| anyhow!("{} reports no known model", device.device_id))?;
    Ok((device.device_id, kind))
}

async fn send(
    cfg: &Config,
    ip: IpAddr,
    file: PathBuf,
    model: Option<String>,
    filename: String,
) -> Result<()> {
    let payload = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let (device_id, kind) = resolve_target(cfg, ip, model).await?;

    let token_path = tokens::default_path();
    let store = token_path
        .as_deref()
        .map(tokens::load)
        .unwrap_or_else(TokenStore::new);
    let store = Arc::new(Mutex::new(store));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = transport::for_device(kind, ip, cfg)?;
    let handle = DeviceConnection::new(
        transport,
        store.clone(),
        EventSink::new(device_id.clone(), events_tx),
        cfg.connection(),
    )
    .spawn();
    let printer = tokio::spawn(print_events(events_rx));

    let ticket = handle.request_write(UploadJob::new(filename, payload)).await?;
    let result = tokio::select! {
        r = ticket.finished() => r,
        _ = shutdown_signal() => {
            handle.disconnect().await;
            Err(printlink::Error::Cancelled)
        }
    };
    drop(handle);
    let _ = printer.await;

    if let Some(path) = token_path {
        if let Err(e) = tokens::save(&path, &*store.lock().await) {
            tracing::warn!(error = %e, "could not save tokens");
        }
    }
    result.with_context(|| format!("sending to {}", device_id))
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(ev) = rx.recv().await {
        match ev.kind {
            EventKind::StateChanged(state) => {
                tracing::info!(device_id = %ev.device_id, %state, "connection state")
            }
            EventKind::AuthenticationRequested => {
                println!("Accept the connection on the printer's touchscreen to continue.")
            }
            EventKind::AuthenticationDenied => {
                eprintln!("{}: connection refused on the touchscreen", ev.device_id)
            }
            EventKind::DeviceStatus(status) => {
                tracing::info!(device_id = %ev.device_id, %status, "device status")
            }
            EventKind::Progress { sent, total } => {
                let pct = if total == 0 { 100 } else { sent * 100 / total };
                println!("Sending... {:>3}% ({}/{} bytes)", pct, sent, total);
            }
            EventKind::UploadFinished { filename } => println!(
                "Sent {} to {}. Start the print on the touchscreen.",
                filename, ev.device_id
            ),
            EventKind::Failed(msg) => eprintln!("{}: {}", ev.device_id, msg),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
