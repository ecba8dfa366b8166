//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use crsync_protocol::{RoomId, SiteId, Value, MAX_ROOM_LEN};
use proptest::prelude::*;

/// Strategy for generating site ids.
pub fn site_id_strategy() -> impl Strategy<Value = SiteId> {
    prop::array::uniform16(any::<u8>()).prop_map(SiteId::from_bytes)
}

/// Strategy for generating valid room ids.
pub fn room_id_strategy() -> impl Strategy<Value = RoomId> {
    let pattern = format!("[a-zA-Z0-9_-][a-zA-Z0-9_.-]{{0,{}}}", MAX_ROOM_LEN - 1);
    prop::string::string_regex(&pattern)
        .expect("Invalid regex")
        .prop_map(|s| RoomId::new(s).expect("generated room id is valid"))
}

/// Strategy for generating column values of every kind.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        // Finite reals; NaN payloads make equality assertions noisy.
        (-1.0e9f64..1.0e9).prop_map(Value::Real),
        "[a-z]{0,8}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Blob),
    ]
}

/// A local write a replica might perform.
#[derive(Debug, Clone)]
pub struct CellWrite {
    /// Row key.
    pub pk: Vec<u8>,
    /// Column name.
    pub cid: String,
    /// Written value.
    pub val: Value,
}

/// Strategy for a write into a small key space, so writes from different
/// replicas collide often.
pub fn cell_write_strategy() -> impl Strategy<Value = CellWrite> {
    (0u8..4, prop::sample::select(vec!["title", "done", "rank"]), value_strategy()).prop_map(
        |(pk, cid, val)| CellWrite {
            pk: vec![pk],
            cid: cid.to_string(),
            val,
        },
    )
}

/// Strategy for a sequence of writes.
pub fn cell_writes_strategy(max: usize) -> impl Strategy<Value = Vec<CellWrite>> {
    prop::collection::vec(cell_write_strategy(), 0..max)
}
