//! One actor task per printer. It owns the transport and the connection state machine;
//! callers talk to it through a cloneable [`DeviceHandle`].
//!
//! Only one operation runs at a time. While it runs, a second write is answered `Busy` at once,
//! a write arriving during a plain connect is queued until the connection is up, and a disconnect
//! (or dropping every handle) abandons the operation and closes the transport.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use printlink_core::{ConnectionMachine, ConnectionState, StateError, TokenStore};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink};
use crate::transport::{AuthOutcome, Transport, UploadJob};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Interval between authorization polls while the touchscreen prompt is open.
    pub auth_poll_interval: Duration,
    /// Give up on authentication after this long. `None` waits forever.
    pub auth_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            auth_poll_interval: Duration::from_millis(1500),
            auth_timeout: Some(Duration::from_secs(300)),
        }
    }
}

enum Command {
    Connect {
        done: oneshot::Sender<Result<()>>,
    },
    Write {
        job: UploadJob,
        accepted: oneshot::Sender<Result<()>>,
        done: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Accepted write waiting for (or running) its transfer.
struct PendingWrite {
    job: UploadJob,
    done: oneshot::Sender<Result<()>>,
}

enum Interrupt {
    Disconnect(oneshot::Sender<()>),
    HandleDropped,
}

/// Resolves when an accepted write has finished.
pub struct WriteTicket {
    done: oneshot::Receiver<Result<()>>,
}

impl WriteTicket {
    pub async fn finished(self) -> Result<()> {
        self.done.await.unwrap_or(Err(Error::Cancelled))
    }
}

#[derive(Clone)]
pub struct DeviceHandle {
    device_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Open and authenticate without sending anything.
    pub async fn connect(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Connect { done })?;
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Ask to send a file. Returns `Busy` straight away if a write is already pending or running;
    /// otherwise a ticket for the transfer's outcome. Connects first if needed.
    pub async fn request_write(&self, job: UploadJob) -> Result<WriteTicket> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (done, done_rx) = oneshot::channel();
        self.send(Command::Write {
            job,
            accepted,
            done,
        })?;
        accepted_rx.await.unwrap_or(Err(Error::Cancelled))?;
        Ok(WriteTicket { done: done_rx })
    }

    /// Abandon whatever is running and close the transport. Returns once the state is Closed.
    pub async fn disconnect(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Command::Disconnect { done }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(|_| Error::Cancelled)
    }
}

/// State machine plus its observers. Locked only between awaits.
struct Machine {
    inner: StdMutex<ConnectionMachine>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventSink,
}

impl Machine {
    fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    fn apply<R>(
        &self,
        step: impl FnOnce(&mut ConnectionMachine) -> std::result::Result<R, StateError>,
    ) -> Result<R> {
        let (before, out, after) = {
            let mut m = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let before = m.state();
            let out = step(&mut m);
            (before, out, m.state())
        };
        if before != after {
            debug!(device_id = %self.events.device_id(), from = %before, to = %after, "state changed");
            self.state_tx.send_replace(after);
            self.events.emit(EventKind::StateChanged(after));
        }
        Ok(out?)
    }

    fn close(&self) {
        let _ = self.apply(|m| {
            m.close();
            Ok(())
        });
    }
}

/// Everything an operation needs besides the state machine.
struct Link<T> {
    device_id: String,
    transport: T,
    tokens: Arc<Mutex<TokenStore>>,
    events: EventSink,
    settings: ConnectionSettings,
}

pub struct DeviceConnection<T> {
    link: Link<T>,
    machine: Machine,
}

impl<T: Transport + 'static> DeviceConnection<T> {
    pub fn new(
        transport: T,
        tokens: Arc<Mutex<TokenStore>>,
        events: EventSink,
        settings: ConnectionSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            link: Link {
                device_id: events.device_id().to_string(),
                transport,
                tokens,
                events: events.clone(),
                settings,
            },
            machine: Machine {
                inner: StdMutex::new(ConnectionMachine::new()),
                state_tx,
                events,
            },
        }
    }

    /// Start the actor on the current runtime.
    pub fn spawn(self) -> DeviceHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle {
            device_id: self.link.device_id.clone(),
            commands,
            state: self.machine.state_tx.subscribe(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let DeviceConnection { mut link, machine } = self;
        let mut queued: Option<PendingWrite> = None;
        loop {
            let write = match queued.take() {
                Some(write) => write,
                None => match commands.recv().await {
                    None => break,
                    Some(Command::Connect { done }) => {
                        if machine.state() == ConnectionState::Connected {
                            let _ = done.send(Ok(()));
                            continue;
                        }
                        let outcome =
                            drive(establish(&mut link, &machine), &mut commands, &machine, &mut queued)
                                .await;
                        match outcome {
                            Ok(Ok(())) => {
                                let _ = done.send(Ok(()));
                            }
                            Ok(Err(e)) => {
                                report(&link, &e);
                                close_session(&mut link, &machine).await;
                                if let Some(write) = queued.take() {
                                    let _ = write.done.send(Err(e.clone()));
                                }
                                let _ = done.send(Err(e));
                            }
                            Err(interrupt) => {
                                let _ = done.send(Err(Error::Cancelled));
                                if let Some(write) = queued.take() {
                                    let _ = write.done.send(Err(Error::Cancelled));
                                }
                                if !finish_interrupt(interrupt, &mut link, &machine).await {
                                    break;
                                }
                            }
                        }
                        continue;
                    }
                    Some(Command::Write {
                        job,
                        accepted,
                        done,
                    }) => match machine.apply(|m| m.request_write()) {
                        Ok(_) => {
                            let _ = accepted.send(Ok(()));
                            PendingWrite { job, done }
                        }
                        Err(e) => {
                            let _ = accepted.send(Err(e));
                            continue;
                        }
                    },
                    Some(Command::Disconnect { done }) => {
                        close_session(&mut link, &machine).await;
                        let _ = done.send(());
                        continue;
                    }
                },
            };

            let PendingWrite { job, done } = write;
            let filename = job.filename.clone();
            let outcome = drive(
                write_session(&mut link, &machine, job),
                &mut commands,
                &machine,
                &mut queued,
            )
            .await;
            match outcome {
                Ok(result) => {
                    match &result {
                        Ok(()) => link.events.emit(EventKind::UploadFinished { filename }),
                        Err(e) => report(&link, e),
                    }
                    close_session(&mut link, &machine).await;
                    let _ = done.send(result);
                }
                Err(interrupt) => {
                    let _ = done.send(Err(Error::Cancelled));
                    if !finish_interrupt(interrupt, &mut link, &machine).await {
                        break;
                    }
                }
            }
        }
        close_session(&mut link, &machine).await;
    }
}

/// Run `op` while still answering commands. Returns early, dropping `op`, on disconnect or when
/// every handle is gone.
async fn drive<F: Future>(
    op: F,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    machine: &Machine,
    queued: &mut Option<PendingWrite>,
) -> std::result::Result<F::Output, Interrupt> {
    tokio::pin!(op);
    loop {
        tokio::select! {
            out = &mut op => return Ok(out),
            cmd = commands.recv() => match cmd {
                None => return Err(Interrupt::HandleDropped),
                Some(Command::Disconnect { done }) => return Err(Interrupt::Disconnect(done)),
                Some(Command::Connect { done }) => {
                    let _ = done.send(Err(Error::Busy));
                }
                Some(Command::Write { job, accepted, done }) => match machine.apply(|m| m.request_write()) {
                    Ok(_) => {
                        let _ = accepted.send(Ok(()));
                        *queued = Some(PendingWrite { job, done });
                    }
                    Err(e) => {
                        let _ = accepted.send(Err(e));
                    }
                },
            },
        }
    }
}

/// Close after an interrupted operation. Returns false when the actor should stop.
async fn finish_interrupt<T: Transport>(
    interrupt: Interrupt,
    link: &mut Link<T>,
    machine: &Machine,
) -> bool {
    info!(device_id = %link.device_id, "operation cancelled");
    close_session(link, machine).await;
    match interrupt {
        Interrupt::Disconnect(done) => {
            let _ = done.send(());
            true
        }
        Interrupt::HandleDropped => false,
    }
}

fn report<T>(link: &Link<T>, e: &Error) {
    warn!(device_id = %link.device_id, error = %e, "device operation failed");
    link.events.emit(EventKind::Failed(e.to_string()));
}

async fn close_session<T: Transport>(link: &mut Link<T>, machine: &Machine) {
    link.transport.close().await;
    machine.close();
}

/// Closed -> Connected, authenticating with the cached token if there is one.
async fn establish<T: Transport>(link: &mut Link<T>, machine: &Machine) -> Result<()> {
    machine.apply(|m| m.connect())?;
    link.transport.open().await?;
    machine.apply(|m| m.transport_ready())?;
    match link.settings.auth_timeout {
        Some(limit) => tokio::time::timeout(limit, authorize(link, machine))
            .await
            .map_err(|_| Error::AuthenticationTimedOut)?,
        None => authorize(link, machine).await,
    }
}

async fn authorize<T: Transport>(link: &mut Link<T>, machine: &Machine) -> Result<()> {
    let cached = link
        .tokens
        .lock()
        .await
        .get(&link.device_id)
        .map(str::to_string);
    let mut outcome = link.transport.authenticate(cached.as_deref()).await?;
    if outcome == AuthOutcome::Expired {
        debug!(device_id = %link.device_id, "cached token refused; reconnecting without it");
        link.tokens.lock().await.remove(&link.device_id);
        outcome = link.transport.authenticate(None).await?;
    }
    let mut prompted = false;
    loop {
        match outcome {
            AuthOutcome::Granted { token, status } => {
                if let Some(token) = token {
                    link.tokens.lock().await.set(&link.device_id, &token);
                }
                if let Some(status) = status {
                    link.events.emit(EventKind::DeviceStatus(status));
                }
                machine.apply(|m| m.authenticated())?;
                info!(device_id = %link.device_id, "connected");
                return Ok(());
            }
            AuthOutcome::Pending => {
                if !prompted {
                    machine.apply(|m| m.confirmation_required())?;
                    link.events.emit(EventKind::AuthenticationRequested);
                    info!(device_id = %link.device_id, "confirm the connection on the touchscreen");
                    prompted = true;
                }
                tokio::time::sleep(link.settings.auth_poll_interval).await;
                outcome = link.transport.poll_authorization().await?;
            }
            AuthOutcome::Denied | AuthOutcome::Expired => {
                link.tokens.lock().await.remove(&link.device_id);
                link.events.emit(EventKind::AuthenticationDenied);
                return Err(Error::AuthenticationDenied);
            }
        }
    }
}

async fn write_session<T: Transport>(
    link: &mut Link<T>,
    machine: &Machine,
    job: UploadJob,
) -> Result<()> {
    if machine.state() != ConnectionState::Connected {
        establish(link, machine).await?;
    }
    machine.apply(|m| m.begin_transfer())?;
    let result = link.transport.upload(&job, &link.events).await;
    machine.apply(|m| m.transfer_finished())?;
    result
}
