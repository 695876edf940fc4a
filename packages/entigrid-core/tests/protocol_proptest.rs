//! Property-based round-trip coverage for the frame codec (§8 invariant 2,
//! §12 "a separate smaller integration test exercising the actual framed
//! socket transport end-to-end ... to validate the wire codec itself" --
//! this file covers the codec half; `entigrid-resource`'s
//! `tests/socket_transport.rs` covers the transport half).

use std::collections::BTreeSet;

use bytes::BytesMut;
use proptest::prelude::*;

use entigrid_core::entity::{Operation as EntityOperation, RecordMetadata};
use entigrid_core::protocol::{encode_frame, try_decode_frame, Command, Status, StoredRecord};
use entigrid_core::query::Query;
use entigrid_core::value::{PropertyBag, Value};

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<Vec<u8>>().prop_map(Value::Bytes),
        ".*".prop_map(Value::String),
        any::<i64>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Date),
        "[a-z0-9-]{1,12}".prop_map(Value::Reference),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| prop::collection::vec(inner, 0..4).prop_map(Value::List))
}

fn arb_property_bag() -> impl Strategy<Value = PropertyBag> {
    prop::collection::btree_map("[a-z][a-z0-9_]{0,8}", arb_value(), 0..5)
}

fn arb_status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Connected),
        Just(Status::Offline),
        Just(Status::Busy),
        Just(Status::Error),
    ]
}

fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        any::<u32>().prop_map(|process_id| Command::Handshake { process_id }),
        Just(Command::Shutdown),
        (any::<u64>()).prop_map(|revision| Command::RevisionUpdate { revision }),
        (any::<u32>(), any::<bool>(), proptest::option::of(any::<u32>())).prop_map(|(completed_message_id, success, code)| {
            Command::CommandCompletion { completed_message_id, success, code: if success { None } else { code } }
        }),
        arb_status().prop_map(|status| Command::Notification { status }),
        ("[a-z]{1,10}", proptest::option::of("[a-z0-9-]{1,12}"), any::<bool>(), arb_property_bag()).prop_map(
            |(domain_type, entity_id, replay_to_source, delta)| Command::CreateEntity {
                domain_type,
                entity_id,
                replay_to_source,
                delta,
            }
        ),
        ("[a-z]{1,10}", "[a-z0-9-]{1,12}", any::<bool>()).prop_map(|(domain_type, entity_id, replay_to_source)| {
            Command::DeleteEntity { domain_type, entity_id, replay_to_source }
        }),
    ]
}

proptest! {
    #[test]
    fn command_frame_round_trips(message_id in any::<u32>(), command in arb_command()) {
        let mut buf = BytesMut::new();
        encode_frame(message_id, &command, &mut buf).unwrap();

        let (decoded_id, decoded_command) = try_decode_frame(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded_id, message_id);
        prop_assert_eq!(decoded_command, command);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn truncated_frame_never_decodes(message_id in any::<u32>(), command in arb_command(), cut in 0usize..12) {
        let mut buf = BytesMut::new();
        encode_frame(message_id, &command, &mut buf).unwrap();
        let truncated_len = buf.len().saturating_sub(cut).min(buf.len() - 1).max(1);
        let mut truncated = BytesMut::from(&buf[..truncated_len]);
        // Either we report "need more bytes" (Ok(None)) or, if the header
        // itself parsed but a 12-byte-aligned cut happened to also look
        // like a shorter valid header, that's still not this same frame.
        if let Ok(Some((id, cmd))) = try_decode_frame(&mut truncated) {
            prop_assert!(id != message_id || cmd != command);
        }
    }

    #[test]
    fn two_frames_decode_independently(a_id in any::<u32>(), a in arb_command(), b_id in any::<u32>(), b in arb_command()) {
        let mut buf = BytesMut::new();
        encode_frame(a_id, &a, &mut buf).unwrap();
        encode_frame(b_id, &b, &mut buf).unwrap();

        let (first_id, first_cmd) = try_decode_frame(&mut buf).unwrap().unwrap();
        let (second_id, second_cmd) = try_decode_frame(&mut buf).unwrap().unwrap();
        prop_assert_eq!(first_id, a_id);
        prop_assert_eq!(first_cmd, a);
        prop_assert_eq!(second_id, b_id);
        prop_assert_eq!(second_cmd, b);
        prop_assert!(buf.is_empty());
    }
}

#[test]
fn stored_record_round_trips_through_msgpack() {
    let record = StoredRecord {
        metadata: RecordMetadata {
            revision: 5,
            operation: EntityOperation::Modification,
            replay_to_source: true,
            modified_properties: BTreeSet::from(["subject".to_string()]),
        },
        properties: PropertyBag::from([("subject".to_string(), Value::String("hi".into()))]),
    };
    let bytes = rmp_serde::to_vec_named(&record).unwrap();
    let decoded: StoredRecord = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(decoded, record);
}

#[test]
fn synchronize_command_carries_query_through_a_frame() {
    let mut buf = BytesMut::new();
    let command = Command::Synchronize { query: Query::new("Mail") };
    encode_frame(3, &command, &mut buf).unwrap();
    let (message_id, decoded) = try_decode_frame(&mut buf).unwrap().unwrap();
    assert_eq!(message_id, 3);
    assert_eq!(decoded, command);
}
