//! `ResourceAccess`: the client side of the framed IPC channel a facade uses
//! to talk to one resource process (§4.G).
//!
//! Mirrors the reference implementation's single-event-loop design: one
//! background task owns the socket, a FIFO queue of commands waiting to be
//! sent, and a message-id-keyed table of completion callbacks. Callers never
//! touch the socket directly; they submit commands and await (or ignore)
//! their completion through a channel into the driver task.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use entigrid_core::protocol::{encode_frame, try_decode_frame, Command, Status};

use crate::error::AccessError;

/// Tuning for the connect/spawn/backoff state machine.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Delay between connect attempts while the resource process is not yet
    /// reachable. The reference client re-arms a single-shot 50ms timer
    /// rather than using a repeating interval, to avoid a connect storm
    /// against a resource process that is merely slow to bind its socket.
    pub backoff_initial: Duration,
    /// Connect attempts to make (spawning the resource process on the
    /// first failure) before giving up and failing queued commands with
    /// [`AccessError::SpawnExhausted`].
    pub backoff_max_attempts: u32,
    /// Path to the resource process binary, invoked as `[binary, instanceId]`
    /// (§6 spawn contract) the first time a connect attempt fails.
    pub resource_binary: PathBuf,
    /// Bounded capacity of the request channel from [`ResourceAccess`]
    /// handles into the driver task.
    pub request_channel_capacity: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(50),
            backoff_max_attempts: 20,
            resource_binary: PathBuf::from("resourced"),
            request_channel_capacity: 256,
        }
    }
}

/// Result of a command that registered a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub code: Option<u32>,
}

/// Events a [`ResourceAccess`] surfaces outside the request/response flow.
#[derive(Debug, Clone)]
pub enum AccessEvent {
    /// The connection to the resource process came up (`true`) or was lost
    /// (`false`).
    Ready(bool),
    /// A commit happened; carries no correlation to any particular command
    /// (§4.G point 5).
    RevisionChanged(u64),
    /// A `Notification` rollup status, aggregated by facades across the
    /// resources belonging to an account.
    Notification(Status),
    /// A frame tagged with a live `Synchronize` subscription's message id:
    /// an entity added, modified, or removed in that query's result set.
    QueryResult { message_id: u32, command: Command },
}

struct QueuedCommand {
    command: Command,
    respond: Option<oneshot::Sender<Result<CommandOutcome, AccessError>>>,
}

enum ActorRequest {
    Send(QueuedCommand),
    Shutdown,
}

/// Handle to a running `ResourceAccess` driver task.
///
/// Cloning is cheap: every clone shares the same request channel and can
/// independently subscribe to [`AccessEvent`]s.
#[derive(Clone)]
pub struct ResourceAccess {
    requests: mpsc::Sender<ActorRequest>,
    events: broadcast::Sender<AccessEvent>,
}

impl ResourceAccess {
    /// Spawns the driver task and returns a handle to it.
    ///
    /// `socket_path` is the listener socket the resource process for
    /// `instance_id` binds (`<storage-root>/<instanceId>/socket`); the
    /// caller resolves it the same way the resource process itself does.
    #[must_use]
    pub fn spawn(instance_id: impl Into<String>, socket_path: PathBuf, config: AccessConfig) -> (Self, ResourceAccessDriver) {
        let (requests_tx, requests_rx) = mpsc::channel(config.request_channel_capacity);
        let (events_tx, _) = broadcast::channel(64);

        let driver = Driver {
            instance_id: instance_id.into(),
            socket_path,
            config,
            queue: VecDeque::new(),
            callbacks: HashMap::new(),
            message_id: 0,
            starting_process: false,
            events_tx: events_tx.clone(),
        };

        let handle = tokio::spawn(driver.run(requests_rx));
        (Self { requests: requests_tx, events: events_tx }, ResourceAccessDriver { handle })
    }

    /// Subscribes to [`AccessEvent`]s. Each subscriber gets its own
    /// receiver; events broadcast after subscription are never missed, but
    /// a slow subscriber can lag and see [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<AccessEvent> {
        self.events.subscribe()
    }

    /// Sends `command` and awaits its `CommandCompletion`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Shutdown`] if the driver task is gone, or
    /// [`AccessError::Disconnected`] if the connection drops before a
    /// completion frame for this command arrives.
    pub async fn send_command(&self, command: Command) -> Result<CommandOutcome, AccessError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(ActorRequest::Send(QueuedCommand { command, respond: Some(tx) }))
            .await
            .map_err(|_| AccessError::Shutdown)?;
        rx.await.map_err(|_| AccessError::Shutdown)?
    }

    /// Queues `command` without waiting for a completion, matching the
    /// reference client's callback-less `sendCommand` overload.
    pub async fn queue_command(&self, command: Command) {
        let _ = self.requests.send(ActorRequest::Send(QueuedCommand { command, respond: None })).await;
    }

    /// Stops the driver task. Commands still queued or awaiting completion
    /// resolve with [`AccessError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.requests.send(ActorRequest::Shutdown).await;
    }
}

/// Owns the join handle for the background driver task spawned by
/// [`ResourceAccess::spawn`]. Dropping it does not stop the driver; call
/// [`ResourceAccess::shutdown`] and then await this to observe task exit.
pub struct ResourceAccessDriver {
    handle: JoinHandle<()>,
}

impl ResourceAccessDriver {
    /// Waits for the driver task to exit (after [`ResourceAccess::shutdown`]
    /// has been called).
    ///
    /// # Panics
    ///
    /// Panics if the driver task itself panicked.
    pub async fn join(self) {
        self.handle.await.expect("resource access driver task panicked");
    }
}

struct Driver {
    instance_id: String,
    socket_path: PathBuf,
    config: AccessConfig,
    queue: VecDeque<QueuedCommand>,
    callbacks: HashMap<u32, oneshot::Sender<Result<CommandOutcome, AccessError>>>,
    message_id: u32,
    starting_process: bool,
    events_tx: broadcast::Sender<AccessEvent>,
}

impl Driver {
    async fn run(mut self, mut requests: mpsc::Receiver<ActorRequest>) {
        let mut write_half: Option<OwnedWriteHalf> = None;
        let mut read_half: Option<OwnedReadHalf> = None;
        let mut read_buf = BytesMut::with_capacity(4096);
        let mut connect_attempts: u32 = 0;

        loop {
            if read_half.is_none() {
                match UnixStream::connect(&self.socket_path).await {
                    Ok(stream) => {
                        connect_attempts = 0;
                        self.starting_process = false;
                        self.message_id = 0;
                        let (r, mut w) = stream.into_split();
                        if self.send_handshake(&mut w).await.is_ok() {
                            read_half = Some(r);
                            write_half = Some(w);
                            let _ = self.events_tx.send(AccessEvent::Ready(true));
                            self.drain_queue(&mut write_half, &mut read_half).await;
                        }
                        continue;
                    }
                    Err(e) => {
                        debug!(instance_id = %self.instance_id, error = %e, "connect failed");
                        if !self.starting_process {
                            self.starting_process = true;
                            self.spawn_resource_process();
                        }
                        connect_attempts += 1;
                        if connect_attempts == self.config.backoff_max_attempts {
                            warn!(instance_id = %self.instance_id, attempts = connect_attempts, "resource process unreachable after repeated attempts");
                            self.fail_all_queued(&|| AccessError::SpawnExhausted);
                        }
                        tokio::select! {
                            () = tokio::time::sleep(self.config.backoff_initial) => {}
                            maybe_req = requests.recv() => {
                                match maybe_req {
                                    Some(ActorRequest::Send(qc)) => self.queue.push_back(qc),
                                    Some(ActorRequest::Shutdown) | None => return self.fail_all_queued(&|| AccessError::Shutdown),
                                }
                            }
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                biased;
                maybe_req = requests.recv() => {
                    match maybe_req {
                        Some(ActorRequest::Send(qc)) => {
                            self.queue.push_back(qc);
                            self.drain_queue(&mut write_half, &mut read_half).await;
                        }
                        Some(ActorRequest::Shutdown) | None => {
                            if let Some(mut w) = write_half.take() {
                                let _ = w.shutdown().await;
                            }
                            return self.fail_all_queued(&|| AccessError::Shutdown);
                        }
                    }
                }
                result = read_frame(&mut read_half, &mut read_buf) => {
                    match result {
                        Ok(Some((header_id, command))) => self.handle_inbound(header_id, command),
                        Ok(None) => {
                            info!(instance_id = %self.instance_id, "disconnected from resource process");
                            read_half = None;
                            write_half = None;
                            let _ = self.events_tx.send(AccessEvent::Ready(false));
                            self.fail_pending_callbacks(&|| AccessError::Disconnected);
                        }
                        Err(e) => {
                            warn!(instance_id = %self.instance_id, error = %e, "malformed frame from resource process");
                        }
                    }
                }
            }
        }
    }

    async fn send_handshake(&mut self, write_half: &mut OwnedWriteHalf) -> std::io::Result<()> {
        let mut buf = BytesMut::new();
        let command = Command::Handshake { process_id: std::process::id() };
        if encode_frame(self.message_id, &command, &mut buf).is_err() {
            return Ok(());
        }
        write_half.write_all(&buf).await
    }

    async fn drain_queue(&mut self, write_half: &mut Option<OwnedWriteHalf>, read_half: &mut Option<OwnedReadHalf>) {
        while let Some(mut qc) = self.queue.pop_front() {
            let Some(w) = write_half.as_mut() else { self.queue.push_front(qc); break };

            self.message_id += 1;
            let message_id = self.message_id;

            let mut buf = BytesMut::new();
            if let Err(e) = encode_frame(message_id, &qc.command, &mut buf) {
                if let Some(respond) = qc.respond.take() {
                    let _ = respond.send(Err(AccessError::Encode(e)));
                }
                continue;
            }

            match w.write_all(&buf).await {
                Ok(()) => {
                    if let Some(respond) = qc.respond.take() {
                        self.callbacks.insert(message_id, respond);
                    }
                }
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "write failed, will reconnect");
                    self.queue.push_front(qc);
                    *write_half = None;
                    *read_half = None;
                    let _ = self.events_tx.send(AccessEvent::Ready(false));
                    self.fail_pending_callbacks(&|| AccessError::Disconnected);
                    break;
                }
            }
        }
    }

    fn handle_inbound(&mut self, header_message_id: u32, command: Command) {
        match command {
            Command::CommandCompletion { completed_message_id, success, code } => {
                if let Some(tx) = self.callbacks.remove(&completed_message_id) {
                    let _ = tx.send(Ok(CommandOutcome { success, code }));
                }
            }
            Command::RevisionUpdate { revision } => {
                let _ = self.events_tx.send(AccessEvent::RevisionChanged(revision));
            }
            Command::Notification { status } => {
                let _ = self.events_tx.send(AccessEvent::Notification(status));
            }
            other => {
                let _ = self.events_tx.send(AccessEvent::QueryResult { message_id: header_message_id, command: other });
            }
        }
    }

    fn fail_pending_callbacks(&mut self, make_err: &dyn Fn() -> AccessError) {
        for (_, tx) in self.callbacks.drain() {
            let _ = tx.send(Err(make_err()));
        }
    }

    fn fail_all_queued(&mut self, make_err: &dyn Fn() -> AccessError) {
        self.fail_pending_callbacks(make_err);
        for mut qc in self.queue.drain(..) {
            if let Some(respond) = qc.respond.take() {
                let _ = respond.send(Err(make_err()));
            }
        }
    }

    fn spawn_resource_process(&self) {
        info!(instance_id = %self.instance_id, binary = %self.config.resource_binary.display(), "spawning resource process");
        match tokio::process::Command::new(&self.config.resource_binary).arg(&self.instance_id).spawn() {
            Ok(child) => drop(child),
            Err(e) => warn!(instance_id = %self.instance_id, error = %e, "failed to spawn resource process"),
        }
    }
}

/// Reads and decodes one frame from `read_half`, or returns `Ok(None)` if
/// the peer closed the connection. Never resolves if `read_half` is `None`
/// (used as a `tokio::select!` arm that should simply not fire).
async fn read_frame(
    read_half: &mut Option<OwnedReadHalf>,
    buf: &mut BytesMut,
) -> std::io::Result<Option<(u32, Command)>> {
    let Some(r) = read_half.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        if let Ok(Some((id, command))) = try_decode_frame(buf) {
            return Ok(Some((id, command)));
        }
        let mut chunk = [0u8; 4096];
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
