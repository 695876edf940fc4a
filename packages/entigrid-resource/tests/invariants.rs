//! Property-based coverage of the seven invariants named for the
//! entity store/pipeline core, driven against an in-process
//! `EntityStore` + `Pipeline` pair (no socket).

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::tempdir;

use entigrid_core::error::CoreError;
use entigrid_core::value::{PropertyBag, Value};
use entigrid_resource::pipeline::{CreateEntityCommand, DeleteEntityCommand, ModifyEntityCommand};
use entigrid_resource::storage::kv::EntityStore;
use entigrid_resource::typeindex::TypeIndex;
use entigrid_resource::{Pipeline, PipelineError};

fn folder_bag(folder: &str) -> PropertyBag {
    PropertyBag::from([("folder".to_string(), Value::String(folder.to_string()))])
}

fn mail_pipeline() -> (Pipeline, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let store = Arc::new(EntityStore::open(&dir.path().join("s.redb")).unwrap());
    let mut pipeline = Pipeline::new(store);
    pipeline.register_type_index("Mail", TypeIndex::new("Mail").add_property("folder").add_property_with_sorting("folder", "date"));
    (pipeline, dir)
}

#[derive(Debug, Clone)]
enum Op {
    Create { uid: String, folder: String },
    Modify { uid: String, folder: String },
    Delete { uid: String },
}

fn arb_op(uids: &[&'static str], folders: &[&'static str]) -> impl Strategy<Value = Op> {
    prop_oneof![
        (prop::sample::select(uids.to_vec()), prop::sample::select(folders.to_vec()))
            .prop_map(|(uid, folder)| Op::Create { uid: uid.to_string(), folder: folder.to_string() }),
        (prop::sample::select(uids.to_vec()), prop::sample::select(folders.to_vec()))
            .prop_map(|(uid, folder)| Op::Modify { uid: uid.to_string(), folder: folder.to_string() }),
        prop::sample::select(uids.to_vec()).prop_map(|uid| Op::Delete { uid: uid.to_string() }),
    ]
}

proptest! {
    // Invariant 1: maxRevision is monotonically non-decreasing across commits.
    #[test]
    fn max_revision_is_monotonic(ops in prop::collection::vec(arb_op(&["a", "b", "c"], &["inbox", "archive"]), 1..40)) {
        let (pipeline, _dir) = mail_pipeline();
        let mut last_revision = 0u64;

        for op in ops {
            let outcome = match op {
                Op::Create { uid, folder } => pipeline.create_entity(CreateEntityCommand {
                    entity_type: "Mail".into(),
                    entity_id: Some(uid),
                    replay_to_source: true,
                    delta: folder_bag(&folder),
                }),
                Op::Modify { uid, folder } => pipeline.modify_entity(ModifyEntityCommand {
                    entity_type: "Mail".into(),
                    entity_id: uid,
                    revision: last_revision,
                    replay_to_source: true,
                    modified_properties: BTreeSet::from(["folder".to_string()]),
                    deletions: BTreeSet::new(),
                    delta: folder_bag(&folder),
                }),
                Op::Delete { uid } => pipeline.delete_entity(DeleteEntityCommand {
                    entity_type: "Mail".into(),
                    entity_id: uid,
                    replay_to_source: true,
                }),
            };

            if let Ok(outcome) = outcome {
                prop_assert!(outcome.revision > last_revision);
                last_revision = outcome.revision;
            }
            // A rejected command (NotFound/AlreadyExists/AlreadyRemoved) must
            // never move maxRevision.
            let current = pipeline.store().begin_read().unwrap().max_revision().unwrap();
            prop_assert_eq!(current, last_revision);
        }
    }

    // Invariant 4 (round-trip): Create -> Read returns the written props;
    // Create -> Modify -> Read returns the updated value; Create -> Delete
    // -> Read returns NotFound.
    #[test]
    fn round_trip_create_modify_delete(folder_a in "[a-z]{1,8}", folder_b in "[a-z]{1,8}") {
        let (pipeline, _dir) = mail_pipeline();

        pipeline
            .create_entity(CreateEntityCommand {
                entity_type: "Mail".into(),
                entity_id: Some("m1".into()),
                replay_to_source: true,
                delta: folder_bag(&folder_a),
            })
            .unwrap();
        {
            let txn = pipeline.store().begin_read().unwrap();
            let latest = txn.find_latest("Mail", "m1").unwrap().unwrap();
            prop_assert_eq!(latest.get("folder"), Some(&Value::String(folder_a.clone())));
        }

        pipeline
            .modify_entity(ModifyEntityCommand {
                entity_type: "Mail".into(),
                entity_id: "m1".into(),
                revision: 1,
                replay_to_source: true,
                modified_properties: BTreeSet::from(["folder".to_string()]),
                deletions: BTreeSet::new(),
                delta: folder_bag(&folder_b),
            })
            .unwrap();
        {
            let txn = pipeline.store().begin_read().unwrap();
            let latest = txn.find_latest("Mail", "m1").unwrap().unwrap();
            prop_assert_eq!(latest.get("folder"), Some(&Value::String(folder_b)));
        }

        pipeline
            .delete_entity(DeleteEntityCommand { entity_type: "Mail".into(), entity_id: "m1".into(), replay_to_source: true })
            .unwrap();
        {
            let txn = pipeline.store().begin_read().unwrap();
            let latest = txn.find_latest("Mail", "m1").unwrap().unwrap();
            prop_assert!(latest.is_removed());
        }
        let err = pipeline
            .delete_entity(DeleteEntityCommand { entity_type: "Mail".into(), entity_id: "m1".into(), replay_to_source: true })
            .unwrap_err();
        prop_assert!(matches!(err, PipelineError::Core(CoreError::AlreadyRemoved)));
    }

    // Invariant 6: iterating a (prop, sortProp=Date) index yields entries
    // ordered by prop-byte ascending, then by date descending.
    #[test]
    fn sorted_index_orders_by_folder_then_date_descending(
        dates in prop::collection::hash_set(0i64..2_000_000_000, 3..8)
    ) {
        let dir = tempdir().unwrap();
        let store = Arc::new(EntityStore::open(&dir.path().join("s.redb")).unwrap());
        let mut pipeline = Pipeline::new(store);
        pipeline.register_type_index(
            "Mail",
            TypeIndex::new("Mail").add_property_with_sorting("folder", "date"),
        );

        let mut dates: Vec<i64> = dates.into_iter().collect();
        dates.sort_unstable();
        for (i, date) in dates.iter().enumerate() {
            pipeline
                .create_entity(CreateEntityCommand {
                    entity_type: "Mail".into(),
                    entity_id: Some(format!("m{i}")),
                    replay_to_source: true,
                    delta: PropertyBag::from([
                        ("folder".to_string(), Value::String("inbox".to_string())),
                        ("date".to_string(), Value::Date(*date)),
                    ]),
                })
                .unwrap();
        }

        let query = entigrid_core::query::Query::new("Mail")
            .filter("folder", entigrid_core::query::Comparator::Equals(Value::String("inbox".into())))
            .sorted_by("date", entigrid_core::query::SortDirection::Descending);
        let results = entigrid_resource::DataStoreQuery::new(query).execute(&pipeline).unwrap();

        let observed: Vec<i64> = results.iter().map(|e| match e.get("date") { Some(Value::Date(d)) => *d, _ => unreachable!() }).collect();
        let mut expected = dates;
        expected.sort_unstable_by(|a, b| b.cmp(a));
        prop_assert_eq!(observed, expected);
    }
}

// Invariant 7: cleanup preserves the tip for non-removed entities and
// deletes the tip for removed ones; `Read(uid)` is unaffected for the
// surviving case.
#[test]
fn cleanup_preserves_live_tip_and_drops_removed_tip() {
    let (pipeline, _dir) = mail_pipeline();

    pipeline
        .create_entity(CreateEntityCommand {
            entity_type: "Mail".into(),
            entity_id: Some("live".into()),
            replay_to_source: true,
            delta: folder_bag("inbox"),
        })
        .unwrap();
    let live_outcome = pipeline
        .modify_entity(ModifyEntityCommand {
            entity_type: "Mail".into(),
            entity_id: "live".into(),
            revision: 1,
            replay_to_source: true,
            modified_properties: BTreeSet::from(["folder".to_string()]),
            deletions: BTreeSet::new(),
            delta: folder_bag("archive"),
        })
        .unwrap();

    pipeline
        .create_entity(CreateEntityCommand {
            entity_type: "Mail".into(),
            entity_id: Some("gone".into()),
            replay_to_source: true,
            delta: folder_bag("inbox"),
        })
        .unwrap();
    let gone_outcome = pipeline
        .delete_entity(DeleteEntityCommand { entity_type: "Mail".into(), entity_id: "gone".into(), replay_to_source: true })
        .unwrap();

    pipeline.cleanup_revision(live_outcome.revision.max(gone_outcome.revision)).unwrap();

    let txn = pipeline.store().begin_read().unwrap();
    let live_history = txn.scan("Mail", "live").unwrap();
    assert_eq!(live_history.len(), 1);
    assert!(!live_history[0].is_removed());

    let gone_history = txn.scan("Mail", "gone").unwrap();
    assert!(gone_history.is_empty());
}

// Idempotent-commit corollary of invariant 5: running cleanup twice at the
// same revision is a no-op the second time (no further records vanish, the
// cleaned-up marker does not move backwards).
#[test]
fn repeated_cleanup_at_same_revision_is_idempotent() {
    let (pipeline, _dir) = mail_pipeline();
    pipeline
        .create_entity(CreateEntityCommand {
            entity_type: "Mail".into(),
            entity_id: Some("m1".into()),
            replay_to_source: true,
            delta: folder_bag("inbox"),
        })
        .unwrap();
    let outcome = pipeline
        .modify_entity(ModifyEntityCommand {
            entity_type: "Mail".into(),
            entity_id: "m1".into(),
            revision: 1,
            replay_to_source: true,
            modified_properties: BTreeSet::from(["folder".to_string()]),
            deletions: BTreeSet::new(),
            delta: folder_bag("archive"),
        })
        .unwrap();

    pipeline.cleanup_revision(outcome.revision).unwrap();
    let after_first = pipeline.store().begin_read().unwrap().scan("Mail", "m1").unwrap().len();
    pipeline.cleanup_revision(outcome.revision).unwrap();
    let after_second = pipeline.store().begin_read().unwrap().scan("Mail", "m1").unwrap().len();

    assert_eq!(after_first, after_second);
    assert_eq!(pipeline.store().begin_read().unwrap().cleaned_up_revision().unwrap(), outcome.revision);
}
