//! Domain services: `PipelineService` (entity mutations), `SyncWorkerService`
//! (query execution), `ControlService` (handshake/shutdown). Each implements
//! both `ManagedService` (lifecycle) and `tower::Service<Operation>`
//! (request handling), registered once in the `OperationRouter` at startup
//! (§4.H).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tower::Service;

use crate::network::shutdown::ShutdownController;
use crate::pipeline::{CreateEntityCommand, DeleteEntityCommand, ModifyEntityCommand, Pipeline};
use crate::query::DataStoreQuery;
use crate::service::operation::{service_names, Operation, OperationError, OperationResponse};
use crate::service::registry::{ManagedService, ServiceContext};

type BoxedFuture = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

// ---------------------------------------------------------------------------
// PipelineService
// ---------------------------------------------------------------------------

/// Handles `CreateEntity`/`ModifyEntity`/`DeleteEntity` by driving the
/// [`Pipeline`] (§4.D).
pub struct PipelineService {
    pipeline: Arc<Pipeline>,
}

impl PipelineService {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ManagedService for PipelineService {
    fn name(&self) -> &'static str {
        service_names::PIPELINE
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Service<Operation> for Arc<PipelineService> {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            match op {
                Operation::CreateEntity { ctx, entity_type, entity_id, replay_to_source, delta } => {
                    let outcome = pipeline
                        .create_entity(CreateEntityCommand { entity_type, entity_id, replay_to_source, delta })
                        .map_err(|e| OperationError::Core(e.into()))?;
                    Ok(OperationResponse::Committed { call_id: ctx.call_id, revision: outcome.revision })
                }
                Operation::ModifyEntity {
                    ctx,
                    entity_type,
                    entity_id,
                    revision,
                    replay_to_source,
                    modified_properties,
                    deletions,
                    delta,
                } => {
                    let outcome = pipeline
                        .modify_entity(ModifyEntityCommand {
                            entity_type,
                            entity_id,
                            revision,
                            replay_to_source,
                            modified_properties,
                            deletions,
                            delta,
                        })
                        .map_err(|e| OperationError::Core(e.into()))?;
                    Ok(OperationResponse::Committed { call_id: ctx.call_id, revision: outcome.revision })
                }
                Operation::DeleteEntity { ctx, entity_type, entity_id, replay_to_source } => {
                    let outcome = pipeline
                        .delete_entity(DeleteEntityCommand { entity_type, entity_id, replay_to_source })
                        .map_err(|e| OperationError::Core(e.into()))?;
                    Ok(OperationResponse::Committed { call_id: ctx.call_id, revision: outcome.revision })
                }
                _ => Err(OperationError::WrongService),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// SyncWorkerService
// ---------------------------------------------------------------------------

/// Handles `Synchronize` by compiling and executing a [`DataStoreQuery`]
/// against the current snapshot (§4.E). The out-of-scope remote-source
/// adapter feeds its results back through [`PipelineService`] as ordinary
/// commands rather than through this service.
pub struct SyncWorkerService {
    pipeline: Arc<Pipeline>,
}

impl SyncWorkerService {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ManagedService for SyncWorkerService {
    fn name(&self) -> &'static str {
        service_names::SYNC
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Service<Operation> for Arc<SyncWorkerService> {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            match op {
                Operation::Synchronize { ctx, query } => {
                    let entities =
                        DataStoreQuery::new(query).execute(&pipeline).map_err(|e| OperationError::Core(e.into()))?;
                    let uids = entities.into_iter().map(|e| e.uid).collect();
                    Ok(OperationResponse::QueryResult { call_id: ctx.call_id, uids })
                }
                _ => Err(OperationError::WrongService),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// ControlService
// ---------------------------------------------------------------------------

/// Handles `Handshake`/`Shutdown`, the two operations owned by the resource
/// process shell rather than the entity store (§4.I).
pub struct ControlService {
    shutdown: Arc<ShutdownController>,
}

impl ControlService {
    #[must_use]
    pub fn new(shutdown: Arc<ShutdownController>) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl ManagedService for ControlService {
    fn name(&self) -> &'static str {
        service_names::CONTROL
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Service<Operation> for Arc<ControlService> {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let shutdown = self.shutdown.clone();
        Box::pin(async move {
            match op {
                Operation::Handshake { ctx, .. } => Ok(OperationResponse::HandshakeAck { call_id: ctx.call_id }),
                Operation::Shutdown { ctx } => {
                    shutdown.trigger_shutdown();
                    Ok(OperationResponse::ShutdownAck { call_id: ctx.call_id })
                }
                _ => Err(OperationError::WrongService),
            }
        })
    }
}
