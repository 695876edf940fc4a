//! entigrid resource process: entity store, indexing, pipeline, query
//! engine, and the Unix-domain-socket listener that exposes them to clients
//! of one local entity grid instance.

pub mod config;
pub mod emitter;
pub mod network;
pub mod pipeline;
pub mod query;
pub mod service;
pub mod storage;
pub mod typeindex;

pub use emitter::{Event, ResultProvider};
pub use pipeline::{CommandOutcome, CreateEntityCommand, DeleteEntityCommand, ModifyEntityCommand, Pipeline, PipelineError, Preprocessor};
pub use query::{DataStoreQuery, QueryChange, QueryError};
pub use service::{
    ManagedService, Operation, OperationContext, OperationError, OperationResponse, OperationRouter, OperationService,
    ServerConfig, ServiceContext, ServiceRegistry,
};
pub use storage::{EntityStore, IndexManager, ReadTxn, StoreError, WriteTxn};
pub use typeindex::TypeIndex;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {}
}

/// Integration tests for the full operation pipeline: classify -> middleware
/// -> router -> domain service -> response, exercised the same way the
/// listener drives it (§4.H, §4.I).
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;

    use tower::{Service, ServiceExt};

    use entigrid_core::protocol::Command;
    use entigrid_core::query::Query;
    use entigrid_core::value::PropertyBag;

    use crate::network::ShutdownController;
    use crate::pipeline::Pipeline;
    use crate::service::classify::OperationService;
    use crate::service::config::ServerConfig;
    use crate::service::domain::{ControlService, PipelineService, SyncWorkerService};
    use crate::service::middleware::build_operation_pipeline;
    use crate::service::operation::{service_names, OperationResponse};
    use crate::service::registry::{ServiceContext, ServiceRegistry};
    use crate::service::router::OperationRouter;
    use crate::storage::kv::EntityStore;
    use crate::typeindex::TypeIndex;

    fn setup() -> (OperationService, OperationRouter, ServerConfig, Arc<Pipeline>, Arc<ShutdownController>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EntityStore::open(&dir.path().join("s.redb")).unwrap());
        let mut pipeline = Pipeline::new(store);
        pipeline.register_type_index("Mail", TypeIndex::new("Mail").add_property("folder"));
        let pipeline = Arc::new(pipeline);

        let config = ServerConfig { max_in_flight_commands: 100, command_timeout_ms: 5000, ..ServerConfig::default() };
        let operations = OperationService::new(Arc::new(config.clone()));

        let shutdown = Arc::new(ShutdownController::new());
        let mut router = OperationRouter::new();
        router.register(service_names::PIPELINE, Arc::new(PipelineService::new(pipeline.clone())));
        router.register(service_names::SYNC, Arc::new(SyncWorkerService::new(pipeline.clone())));
        router.register(service_names::CONTROL, Arc::new(ControlService::new(shutdown.clone())));

        (operations, router, config, pipeline, shutdown, dir)
    }

    #[tokio::test]
    async fn full_pipeline_creates_entity_and_commits() {
        let (operations, router, config, _pipeline, _shutdown, _dir) = setup();
        let mut dispatcher = build_operation_pipeline(router, &config);

        let command = Command::CreateEntity {
            domain_type: "Mail".into(),
            entity_id: Some("m1".into()),
            replay_to_source: true,
            delta: PropertyBag::new(),
        };
        let op = operations.classify(command).unwrap();
        assert_eq!(op.ctx().service_name, service_names::PIPELINE);

        let resp = ServiceExt::ready(&mut dispatcher).await.unwrap().call(op).await.unwrap();
        assert!(matches!(resp, OperationResponse::Committed { revision: 1, .. }));
    }

    #[tokio::test]
    async fn full_pipeline_synchronize_routes_to_sync_service() {
        let (operations, router, config, pipeline, _shutdown, _dir) = setup();
        pipeline
            .create_entity(crate::pipeline::CreateEntityCommand {
                entity_type: "Mail".into(),
                entity_id: Some("m1".into()),
                replay_to_source: true,
                delta: PropertyBag::new(),
            })
            .unwrap();

        let mut dispatcher = build_operation_pipeline(router, &config);
        let op = operations.classify(Command::Synchronize { query: Query::new("Mail") }).unwrap();
        assert_eq!(op.ctx().service_name, service_names::SYNC);

        let resp = ServiceExt::ready(&mut dispatcher).await.unwrap().call(op).await.unwrap();
        match resp {
            OperationResponse::QueryResult { uids, .. } => assert_eq!(uids, vec!["m1".to_string()]),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_pipeline_shutdown_triggers_controller() {
        let (operations, router, config, _pipeline, shutdown, _dir) = setup();
        let mut dispatcher = build_operation_pipeline(router, &config);

        let op = operations.classify(Command::Shutdown).unwrap();
        let resp = ServiceExt::ready(&mut dispatcher).await.unwrap().call(op).await.unwrap();
        assert!(matches!(resp, OperationResponse::ShutdownAck { .. }));
        assert_eq!(shutdown.health_state(), crate::network::HealthState::Draining);
    }

    #[tokio::test]
    async fn classify_rejects_server_to_client_frames() {
        let (operations, ..) = setup();
        let err = operations.classify(Command::RevisionUpdate { revision: 1 }).unwrap_err();
        assert!(matches!(err, crate::service::ClassifyError::ServerToClient(_)));
    }

    #[tokio::test]
    async fn service_registry_lifecycle() {
        let (_operations, _router, config, pipeline, shutdown, _dir) = setup();
        let registry = ServiceRegistry::new();
        registry.register(PipelineService::new(pipeline.clone()));
        registry.register(SyncWorkerService::new(pipeline));
        registry.register(ControlService::new(shutdown));

        let ctx = ServiceContext { config: Arc::new(config) };
        registry.init_all(&ctx).await.unwrap();

        assert!(registry.get::<PipelineService>().is_some());
        assert!(registry.get::<SyncWorkerService>().is_some());
        assert!(registry.get::<ControlService>().is_some());

        registry.shutdown_all(false).await.unwrap();
    }

    #[test]
    fn re_exports_accessible_from_crate_root() {
        let _config = crate::ServerConfig::default();
        let _registry = crate::ServiceRegistry::new();
    }
}
