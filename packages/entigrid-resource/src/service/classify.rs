//! Classification: decodes an inbound [`Command`] into the typed
//! [`Operation`] the router dispatches (§4.H).
//!
//! Only `Command` variants that carry a payload destined for a domain
//! handler classify into an `Operation`. `RevisionUpdate`, `CommandCompletion`,
//! and `Notification` are resource-to-client frames and never arrive as
//! inbound commands; receiving one is a protocol violation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use entigrid_core::protocol::Command;

use super::config::ServerConfig;
use super::operation::{service_names, Operation, OperationContext};

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("command {0:?} is a resource-to-client frame and cannot be classified as inbound")]
    ServerToClient(entigrid_core::protocol::CommandId),
}

/// Assigns call ids and classifies decoded [`Command`]s into [`Operation`]s.
pub struct OperationService {
    config: Arc<ServerConfig>,
    call_id_counter: AtomicU64,
}

impl OperationService {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config, call_id_counter: AtomicU64::new(1) }
    }

    fn next_call_id(&self) -> u64 {
        self.call_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn ctx(&self, service_name: &'static str) -> OperationContext {
        OperationContext::new(self.next_call_id(), service_name, self.config.command_timeout_ms)
    }

    /// Classifies one decoded command into the `Operation` the router
    /// dispatches. The wire `Command`'s `domain_type` field is renamed to
    /// `entity_type` at this boundary, matching the rest of the resource's
    /// internal vocabulary.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::ServerToClient`] for `RevisionUpdate`,
    /// `CommandCompletion`, or `Notification`, which are never valid inbound
    /// frames.
    pub fn classify(&self, command: Command) -> Result<Operation, ClassifyError> {
        Ok(match command {
            Command::Handshake { process_id } => {
                Operation::Handshake { ctx: self.ctx(service_names::CONTROL), process_id }
            }
            Command::Shutdown => Operation::Shutdown { ctx: self.ctx(service_names::CONTROL) },
            Command::CreateEntity { domain_type, entity_id, replay_to_source, delta } => Operation::CreateEntity {
                ctx: self.ctx(service_names::PIPELINE),
                entity_type: domain_type,
                entity_id,
                replay_to_source,
                delta,
            },
            Command::ModifyEntity {
                domain_type,
                entity_id,
                revision,
                replay_to_source,
                modified_properties,
                deletions,
                delta,
            } => Operation::ModifyEntity {
                ctx: self.ctx(service_names::PIPELINE),
                entity_type: domain_type,
                entity_id,
                revision,
                replay_to_source,
                modified_properties,
                deletions,
                delta,
            },
            Command::DeleteEntity { domain_type, entity_id, replay_to_source } => Operation::DeleteEntity {
                ctx: self.ctx(service_names::PIPELINE),
                entity_type: domain_type,
                entity_id,
                replay_to_source,
            },
            Command::Synchronize { query } => Operation::Synchronize { ctx: self.ctx(service_names::SYNC), query },
            Command::RevisionUpdate { .. } => {
                return Err(ClassifyError::ServerToClient(entigrid_core::protocol::CommandId::RevisionUpdate))
            }
            Command::CommandCompletion { .. } => {
                return Err(ClassifyError::ServerToClient(entigrid_core::protocol::CommandId::CommandCompletion))
            }
            Command::Notification { .. } => {
                return Err(ClassifyError::ServerToClient(entigrid_core::protocol::CommandId::Notification))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entigrid_core::value::PropertyBag;

    fn service() -> OperationService {
        OperationService::new(Arc::new(ServerConfig::default()))
    }

    #[test]
    fn handshake_classifies_to_control_service() {
        let op = service().classify(Command::Handshake { process_id: 7 }).unwrap();
        match op {
            Operation::Handshake { ctx, process_id } => {
                assert_eq!(ctx.service_name, service_names::CONTROL);
                assert_eq!(process_id, 7);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn create_entity_renames_domain_type_to_entity_type() {
        let op = service()
            .classify(Command::CreateEntity {
                domain_type: "Mail".into(),
                entity_id: None,
                replay_to_source: true,
                delta: PropertyBag::new(),
            })
            .unwrap();
        match op {
            Operation::CreateEntity { ctx, entity_type, .. } => {
                assert_eq!(entity_type, "Mail");
                assert_eq!(ctx.service_name, service_names::PIPELINE);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn call_ids_increase_monotonically() {
        let service = service();
        let a = service.classify(Command::Shutdown).unwrap();
        let b = service.classify(Command::Shutdown).unwrap();
        assert!(b.ctx().call_id > a.ctx().call_id);
    }

    #[test]
    fn server_to_client_frames_are_rejected() {
        let err = service().classify(Command::RevisionUpdate { revision: 1 }).unwrap_err();
        assert!(matches!(err, ClassifyError::ServerToClient(_)));
    }
}
