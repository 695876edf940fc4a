//! `resourced`: the resource process binary (§4.I, §6 spawn contract).
//!
//! Invoked as `resourced <instance-id> [--config <path>]`, matching the
//! spawn contract a `ResourceAccess` client uses when no socket is found
//! listening: `argv = [binary, instanceId]`. Wires together the layered
//! config, the `EntityStore`/`Pipeline`/`TypeIndex` registry, the
//! classify -> middleware -> router operation pipeline, the Unix-socket
//! listener, a background cleanup worker, and a Prometheus metrics
//! exporter, then runs until a `Shutdown` command or a process signal asks
//! it to drain.

use std::sync::Arc;

use clap::Parser;

use entigrid_resource::config::load as load_config;
use entigrid_resource::network::{share_dispatcher, ConnectionConfig, ConnectionRegistry, ListenerState, ShutdownController};
use entigrid_resource::service::domain::{ControlService, PipelineService, SyncWorkerService};
use entigrid_resource::service::middleware::pipeline::build_operation_pipeline;
use entigrid_resource::service::operation::service_names;
use entigrid_resource::service::worker::{BackgroundRunnable, BackgroundWorker};
use entigrid_resource::service::{OperationRouter, OperationService, ServerConfig, ServiceContext, ServiceRegistry};
use entigrid_resource::storage::kv::EntityStore;
use entigrid_resource::typeindex::TypeIndex;
use entigrid_resource::Pipeline;

/// One resource instance: entity store, pipeline, query engine, and the
/// socket it serves over.
#[derive(Parser, Debug)]
#[command(name = "resourced", about = "entigrid resource process")]
struct Args {
    /// Identifier of the resource instance this process serves. Positional
    /// so the spawn contract (`argv = [binary, instanceId]`) needs no flag.
    instance_id: Option<String>,

    /// Path to a TOML config file layered under env/defaults (§10).
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// Registers the startup `TypeIndex` schema for every domain entity type
/// this PIM engine deals in (§9 "polymorphic type implementations" ->
/// `TypeName -> TypeDescriptor` registry, populated once here instead of
/// scattered `configure(TypeIndex&)` overrides per type).
fn register_default_type_indexes(pipeline: &mut Pipeline) {
    pipeline.register_type_index(
        "Mail",
        TypeIndex::new("Mail")
            .add_property("folder")
            .add_property_with_sorting("folder", "date")
            .add_secondary_property("folder", "account"),
    );
    pipeline.register_type_index(
        "Event",
        TypeIndex::new("Event")
            .add_property("calendar")
            .add_property_with_sorting("calendar", "date"),
    );
    pipeline.register_type_index(
        "Contact",
        TypeIndex::new("Contact").add_property("addressbook"),
    );
    pipeline.register_type_index("Folder", TypeIndex::new("Folder").add_property("account"));
    pipeline.register_type_index("Addressbook", TypeIndex::new("Addressbook").add_property("account"));
}

/// Drives `Pipeline::cleanup_revision` on an idle timer (§4.D Cleanup): a
/// tick reaps every revision strictly behind the store's current high-water
/// mark, since cleanup is advisory and never runs inline with a command.
struct CleanupRunnable {
    pipeline: Arc<Pipeline>,
}

#[async_trait::async_trait]
impl BackgroundRunnable for CleanupRunnable {
    type Task = ();

    async fn run(&mut self, (): ()) {}

    async fn on_tick(&mut self) {
        let max_revision = match self.pipeline.store().begin_read().and_then(|t| t.max_revision()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "cleanup tick: failed to read max revision");
                return;
            }
        };
        if max_revision == 0 {
            return;
        }
        if let Err(e) = self.pipeline.cleanup_revision(max_revision) {
            tracing::warn!(error = %e, "cleanup tick failed");
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();
}

fn init_metrics(config: &ServerConfig) {
    let Some(addr) = config.metrics_listen_addr else { return };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        tracing::warn!(error = %e, "failed to install prometheus exporter");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(instance_id) = args.instance_id {
        config.instance_id = instance_id;
    }
    let config = Arc::new(config);
    init_metrics(&config);

    let instance_dir = config.storage_root.join(&config.instance_id);
    std::fs::create_dir_all(&instance_dir)?;
    let store = Arc::new(EntityStore::open(&instance_dir.join("entities.redb"))?);

    let mut pipeline = Pipeline::new(store);
    register_default_type_indexes(&mut pipeline);
    let pipeline = Arc::new(pipeline);

    let shutdown = Arc::new(ShutdownController::new());

    let registry = ServiceRegistry::new();
    registry.register(PipelineService::new(pipeline.clone()));
    registry.register(SyncWorkerService::new(pipeline.clone()));
    registry.register(ControlService::new(shutdown.clone()));
    registry.init_all(&ServiceContext { config: config.clone() }).await?;

    let mut router = OperationRouter::new();
    router.register(service_names::PIPELINE, Arc::new(PipelineService::new(pipeline.clone())));
    router.register(service_names::SYNC, Arc::new(SyncWorkerService::new(pipeline.clone())));
    router.register(service_names::CONTROL, Arc::new(ControlService::new(shutdown.clone())));
    let dispatcher = share_dispatcher(build_operation_pipeline(router, &config));

    let operations = Arc::new(OperationService::new(config.clone()));
    let connection_registry = Arc::new(ConnectionRegistry::new());
    let connection_config = ConnectionConfig { outbound_channel_capacity: config.outbound_channel_capacity, ..ConnectionConfig::default() };

    let listener_state = Arc::new(ListenerState::new(
        pipeline.clone(),
        operations,
        dispatcher,
        connection_registry,
        connection_config,
        shutdown.clone(),
    ));

    let mut cleanup_worker =
        BackgroundWorker::spawn(CleanupRunnable { pipeline: pipeline.clone() }, config.cleanup_idle_interval(), 1);

    let socket_path = config.resolved_socket_path();
    tracing::info!(instance_id = %config.instance_id, socket = %socket_path.display(), "resourced starting");

    let serve_result = {
        let mut shutdown_rx = shutdown.shutdown_receiver();
        tokio::select! {
            result = entigrid_resource::network::serve(&socket_path, listener_state) => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, shutting down");
                shutdown.trigger_shutdown();
                Ok(())
            }
            _ = shutdown_rx.changed() => Ok(()),
        }
    };

    cleanup_worker.shutdown().await;
    registry.shutdown_all(false).await?;
    serve_result.map_err(anyhow::Error::from)
}
