//! Unix-domain-socket accept loop: the resource process's only network
//! surface (§4.I). Frames in, frames out; no HTTP, no TLS, no cluster peers.
//!
//! Each accepted connection gets its own reader/writer task pair sharing a
//! [`ConnectionHandle`]. Inbound frames are classified into `Operation`s and
//! run through the shared middleware-wrapped [`OperationRouter`]. A
//! `CreateEntity`/`ModifyEntity`/`DeleteEntity` that commits triggers a
//! `RevisionUpdate` broadcast to every connection, and -- for a `Synchronize`
//! whose query has live subscribers -- a diff against the query's
//! [`ResultProvider`] delivered as ordinary `CreateEntity`/`ModifyEntity`/
//! `DeleteEntity` frames tagged with the original message id, reusing the
//! wire vocabulary instead of adding a dedicated query-result command (see
//! the design ledger).

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

use entigrid_core::protocol::{encode_frame, try_decode_frame, Command};
use entigrid_core::query::Query;

use crate::emitter::{Event, ResultProvider};
use crate::pipeline::Pipeline;
use crate::query::DataStoreQuery;
use crate::service::classify::OperationService;
use crate::service::operation::{Operation, OperationError, OperationResponse};

use super::config::ConnectionConfig;
use super::connection::{ConnectionId, ConnectionRegistry, OutboundMessage};
use super::shutdown::ShutdownController;

/// A dispatcher is whatever `build_operation_pipeline` returned, shared
/// across every connection task behind a mutex. Calls are quick and the
/// returned future is polled after the lock is released, so this does not
/// serialize the actual handler work, only the act of obtaining its future.
pub type SharedDispatcher = Arc<Mutex<Box<dyn Service<Operation, Response = OperationResponse, Error = OperationError, Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<OperationResponse, OperationError>> + Send>>> + Send>>>;

/// Adapts the `impl Service<...>` returned by `build_operation_pipeline`
/// (which is not nameable) into the boxed-future trait object
/// [`SharedDispatcher`] expects.
struct BoxedService<S>(S);

impl<S> Service<Operation> for BoxedService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError>,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        Box::pin(self.0.call(op))
    }
}

/// Wraps a middleware-composed dispatcher for sharing across connection
/// tasks behind a mutex (see [`SharedDispatcher`]).
pub fn share_dispatcher<S>(inner: S) -> SharedDispatcher
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send + 'static,
    S::Future: Send + 'static,
{
    Arc::new(Mutex::new(Box::new(BoxedService(inner))))
}

async fn dispatch(dispatcher: &SharedDispatcher, op: Operation) -> Result<OperationResponse, OperationError> {
    let mut guard = dispatcher.lock().await;
    let ready = ServiceExt::<Operation>::ready(&mut *guard).await?;
    let fut = ready.call(op);
    drop(guard);
    fut.await
}

/// Registry of live `Synchronize` subscriptions, keyed by the originating
/// connection and the message id of the `Synchronize` frame that created
/// them.
#[derive(Default)]
struct SubscriptionRegistry {
    providers: SyncMutex<HashMap<(ConnectionId, u32), Arc<ResultProvider>>>,
}

impl SubscriptionRegistry {
    fn insert(&self, conn: ConnectionId, message_id: u32, provider: Arc<ResultProvider>) {
        self.providers.lock().insert((conn, message_id), provider);
    }

    fn remove_all_for(&self, conn: ConnectionId) -> Vec<Arc<ResultProvider>> {
        let mut providers = self.providers.lock();
        let keys: Vec<_> = providers.keys().filter(|(c, _)| *c == conn).cloned().collect();
        keys.into_iter().filter_map(|k| providers.remove(&k)).collect()
    }

    fn all(&self) -> Vec<((ConnectionId, u32), Arc<ResultProvider>)> {
        self.providers.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

/// Shared state every connection task needs. Constructed once in
/// `serve` and cloned (cheaply, via `Arc`) into each connection.
pub struct ListenerState {
    pub pipeline: Arc<Pipeline>,
    pub operations: Arc<OperationService>,
    pub dispatcher: SharedDispatcher,
    pub registry: Arc<ConnectionRegistry>,
    pub connection_config: ConnectionConfig,
    pub shutdown: Arc<ShutdownController>,
    subscriptions: SubscriptionRegistry,
    next_subscription_id: AtomicU64,
}

impl ListenerState {
    #[must_use]
    pub fn new(
        pipeline: Arc<Pipeline>,
        operations: Arc<OperationService>,
        dispatcher: SharedDispatcher,
        registry: Arc<ConnectionRegistry>,
        connection_config: ConnectionConfig,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            pipeline,
            operations,
            dispatcher,
            registry,
            connection_config,
            shutdown,
            subscriptions: SubscriptionRegistry::default(),
            next_subscription_id: AtomicU64::new(1),
        }
    }
}

/// Binds `socket_path` (removing a stale socket file left by a crashed
/// process) and accepts connections until `state.shutdown` signals
/// draining.
///
/// # Errors
///
/// Returns an I/O error if the socket path's parent directory does not
/// exist or the bind fails.
pub async fn serve(socket_path: &Path, state: Arc<ListenerState>) -> io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "listening");
    state.shutdown.set_ready();

    let mut shutdown_rx = state.shutdown.shutdown_receiver();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("listener draining, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state).await {
                                warn!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(stream: UnixStream, state: Arc<ListenerState>) -> io::Result<()> {
    let (handle, mut outbound_rx) = state.registry.register(&state.connection_config);
    let conn_id = handle.id;
    debug!(connection = conn_id.0, "accepted");

    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match msg {
                OutboundMessage::Frame(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                OutboundMessage::Close(_) => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut buf = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 4096];
    let result = loop {
        match read_half.read(&mut read_buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                buf.extend_from_slice(&read_buf[..n]);
                loop {
                    match try_decode_frame(&mut buf) {
                        Ok(Some((message_id, command))) => {
                            if let Err(e) = handle_command(&state, conn_id, &handle, message_id, command).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => break Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                    }
                }
            }
            Err(e) => break Err(e),
        }
    };

    for provider in state.subscriptions_for_removal(conn_id) {
        provider.dispose();
    }
    state.registry.remove(conn_id);
    writer.abort();
    result
}

impl ListenerState {
    fn subscriptions_for_removal(&self, conn: ConnectionId) -> Vec<Arc<ResultProvider>> {
        self.subscriptions.remove_all_for(conn)
    }
}

async fn handle_command(
    state: &Arc<ListenerState>,
    conn_id: ConnectionId,
    handle: &Arc<super::connection::ConnectionHandle>,
    message_id: u32,
    command: Command,
) -> io::Result<()> {
    handle.metadata.write().await.last_activity = std::time::Instant::now();

    if let Command::Synchronize { query } = command {
        return handle_synchronize(state, conn_id, message_id, query).await;
    }

    let op = match state.operations.classify(command) {
        Ok(op) => op,
        Err(e) => {
            warn!(error = %e, "rejected inbound command");
            return send_completion(handle, message_id, false, Some(entigrid_core::error::code::NOT_FOUND)).await;
        }
    };

    match dispatch(&state.dispatcher, op).await {
        Ok(OperationResponse::Committed { revision, .. }) => {
            send_completion(handle, message_id, true, None).await?;
            broadcast_revision(state, revision);
            Ok(())
        }
        Ok(_) => send_completion(handle, message_id, true, None).await,
        Err(e) => send_completion(handle, message_id, false, Some(e.code())).await,
    }
}

async fn handle_synchronize(
    state: &Arc<ListenerState>,
    conn_id: ConnectionId,
    message_id: u32,
    query: Query,
) -> io::Result<()> {
    let Some(handle) = state.registry.get(conn_id) else { return Ok(()) };

    let provider = match ResultProvider::new(DataStoreQuery::new(query), &state.pipeline) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            warn!(error = %e, "synchronize query failed");
            return send_completion(&handle, message_id, false, None).await;
        }
    };

    let (snapshot, mut events) = provider.subscribe();
    for entity in snapshot {
        send_entity_frame(&handle, message_id, &entity, true).await?;
    }
    provider.mark_initial_result_set_complete();
    send_completion(&handle, message_id, true, None).await?;

    state.subscriptions.insert(conn_id, message_id, provider.clone());
    let subscriber_handle = handle.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let result = match event {
                Event::Added(entity) => send_entity_frame(&subscriber_handle, message_id, &entity, true).await,
                Event::Modified(entity) => send_entity_frame(&subscriber_handle, message_id, &entity, false).await,
                Event::Removed(entity) => send_removal_frame(&subscriber_handle, message_id, &entity).await,
                Event::InitialResultSetComplete => Ok(()),
            };
            if result.is_err() {
                break;
            }
        }
    });

    Ok(())
}

async fn send_entity_frame(
    handle: &super::connection::ConnectionHandle,
    message_id: u32,
    entity: &entigrid_core::entity::Entity,
    is_new: bool,
) -> io::Result<()> {
    let command = if is_new {
        Command::CreateEntity {
            domain_type: entity.entity_type.clone(),
            entity_id: Some(entity.uid.clone()),
            replay_to_source: false,
            delta: entity.properties.clone(),
        }
    } else {
        Command::ModifyEntity {
            domain_type: entity.entity_type.clone(),
            entity_id: entity.uid.clone(),
            revision: entity.metadata.revision,
            replay_to_source: false,
            modified_properties: entity.properties.keys().cloned().collect(),
            deletions: std::collections::BTreeSet::new(),
            delta: entity.properties.clone(),
        }
    };
    write_frame(handle, message_id, &command)
}

async fn send_removal_frame(
    handle: &super::connection::ConnectionHandle,
    message_id: u32,
    entity: &entigrid_core::entity::Entity,
) -> io::Result<()> {
    let command = Command::DeleteEntity {
        domain_type: entity.entity_type.clone(),
        entity_id: entity.uid.clone(),
        replay_to_source: false,
    };
    write_frame(handle, message_id, &command)
}

fn write_frame(handle: &super::connection::ConnectionHandle, message_id: u32, command: &Command) -> io::Result<()> {
    let mut buf = BytesMut::new();
    encode_frame(message_id, command, &mut buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if !handle.try_send(OutboundMessage::Frame(buf.to_vec())) {
        return Err(io::Error::new(io::ErrorKind::WouldBlock, "outbound channel full or closed"));
    }
    Ok(())
}

async fn send_completion(
    handle: &super::connection::ConnectionHandle,
    message_id: u32,
    success: bool,
    code: Option<u32>,
) -> io::Result<()> {
    let command = Command::CommandCompletion { completed_message_id: message_id, success, code };
    write_frame(handle, 0, &command)
}

fn broadcast_revision(state: &Arc<ListenerState>, revision: u64) {
    let mut buf = BytesMut::new();
    if encode_frame(0, &Command::RevisionUpdate { revision }, &mut buf).is_ok() {
        state.registry.broadcast(&buf);
    }
    for (_, provider) in state.subscriptions.all() {
        if let Err(e) = provider.poll_revision(&state.pipeline, revision) {
            warn!(error = %e, "failed to advance live query");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::EntityStore;
    use crate::typeindex::TypeIndex;
    use tempfile::tempdir;
    use tokio::net::UnixStream as ClientStream;

    use crate::service::config::ServerConfig;
    use crate::service::domain::{ControlService, PipelineService, SyncWorkerService};
    use crate::service::middleware::pipeline::build_operation_pipeline;
    use crate::service::operation::service_names;
    use crate::service::router::OperationRouter;

    fn make_state(socket_dir: &Path) -> Arc<ListenerState> {
        let store = Arc::new(EntityStore::open(&socket_dir.join("s.redb")).unwrap());
        let mut pipeline = Pipeline::new(store);
        pipeline.register_type_index("Mail", TypeIndex::new("Mail").add_property("folder"));
        let pipeline = Arc::new(pipeline);

        let config = Arc::new(ServerConfig::default());
        let mut router = OperationRouter::new();
        router.register(service_names::PIPELINE, Arc::new(PipelineService::new(pipeline.clone())));
        router.register(service_names::SYNC, Arc::new(SyncWorkerService::new(pipeline.clone())));
        let shutdown = Arc::new(ShutdownController::new());
        router.register(service_names::CONTROL, Arc::new(ControlService::new(shutdown.clone())));

        let dispatcher = build_operation_pipeline(router, &config);
        let boxed = share_dispatcher(dispatcher);

        Arc::new(ListenerState::new(
            pipeline,
            Arc::new(OperationService::new(config)),
            boxed,
            Arc::new(ConnectionRegistry::new()),
            ConnectionConfig::default(),
            shutdown,
        ))
    }

    #[tokio::test]
    async fn accepts_connection_and_acks_handshake() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("resource.sock");
        let state = make_state(dir.path());

        let listener_state = state.clone();
        let socket_path_clone = socket_path.clone();
        let server = tokio::spawn(async move {
            let _ = tokio::time::timeout(std::time::Duration::from_millis(500), serve(&socket_path_clone, listener_state)).await;
        });

        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = ClientStream::connect(&socket_path).await.unwrap();
        let mut buf = BytesMut::new();
        encode_frame(1, &Command::Handshake { process_id: 123 }, &mut buf).unwrap();
        stream.write_all(&buf).await.unwrap();

        let mut response = vec![0u8; entigrid_core::protocol::FRAME_HEADER_LEN + 64];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), stream.read(&mut response)).await.unwrap().unwrap();
        response.truncate(n);
        let mut response = BytesMut::from(&response[..]);
        let (_id, decoded) = try_decode_frame(&mut response).unwrap().unwrap();
        match decoded {
            Command::CommandCompletion { completed_message_id, success, .. } => {
                assert_eq!(completed_message_id, 1);
                assert!(success);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        state.shutdown.trigger_shutdown();
        let _ = server.await;
    }
}
