//! Replicated changes.

use crate::ids::{SiteId, Watermark};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A column value carried by a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    /// Total order used to break ties between concurrent writes.
    ///
    /// Null sorts first, then numbers (integers and reals compared
    /// numerically, an integer before an equal real), then text, then blobs.
    /// Distinct values never compare equal.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Real(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Value::Real(a), Value::Integer(b)) => {
                a.total_cmp(&(*b as f64)).then(Ordering::Greater)
            }
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// A single column change.
///
/// `db_version` and `seq` locate the change in the history of the replica
/// that sent it; `site_id` names the replica the write originated from, which
/// may differ from the sender when changes are relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Table name.
    pub table: String,
    /// Encoded primary key.
    pub pk: Vec<u8>,
    /// Column name.
    pub cid: String,
    /// New column value.
    pub val: Value,
    /// Per-column logical clock.
    pub col_version: u64,
    /// Version of the sending replica at which the change was recorded.
    pub db_version: u64,
    /// Position within `db_version`.
    pub seq: u32,
    /// Replica the write originated from.
    pub site_id: SiteId,
}

impl Change {
    /// Returns the position of this change in the sender's history.
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.db_version, self.seq)
    }
}

/// Schema a client expects the room to use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name.
    pub name: String,
    /// Schema version.
    pub version: i64,
}

impl Schema {
    /// Creates a schema descriptor.
    pub fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_total_order() {
        assert_eq!(Value::Null.total_cmp(&Value::Integer(-5)), Ordering::Less);
        assert_eq!(
            Value::Integer(2).total_cmp(&Value::Real(1.5)),
            Ordering::Greater
        );
        assert_eq!(
            Value::Real(2.0).total_cmp(&Value::Integer(2)),
            Ordering::Greater
        );
        assert_eq!(Value::Null.total_cmp(&Value::Null), Ordering::Equal);
        assert_eq!(
            Value::Text("z".into()).total_cmp(&Value::Blob(vec![0])),
            Ordering::Less
        );
        assert_eq!(
            Value::Text("b".into()).total_cmp(&Value::Text("a".into())),
            Ordering::Greater
        );
    }

    #[test]
    fn change_watermark() {
        let change = Change {
            table: "todo".into(),
            pk: vec![1],
            cid: "title".into(),
            val: Value::Text("milk".into()),
            col_version: 1,
            db_version: 7,
            seq: 2,
            site_id: SiteId::from_bytes([1; 16]),
        };
        assert_eq!(change.watermark(), Watermark::new(7, 2));
    }

    fn value() -> impl proptest::strategy::Strategy<Value = Value> {
        use proptest::prelude::*;
        prop_oneof![
            Just(Value::Null),
            (-3i64..3).prop_map(Value::Integer),
            (-3i64..3).prop_map(|n| Value::Real(n as f64)),
            // -0.0 equals 0.0 but orders before it
            (-3.0f64..3.0)
                .prop_filter("non-zero", |x| *x != 0.0)
                .prop_map(Value::Real),
            "[ab]{0,2}".prop_map(Value::Text),
            proptest::collection::vec(0u8..2, 0..2).prop_map(Value::Blob),
        ]
    }

    proptest::proptest! {
        #[test]
        fn total_cmp_is_antisymmetric(a in value(), b in value()) {
            proptest::prop_assert_eq!(a.total_cmp(&b), b.total_cmp(&a).reverse());
            proptest::prop_assert_eq!(a.total_cmp(&b) == Ordering::Equal, a == b);
        }

        #[test]
        fn total_cmp_is_transitive(a in value(), b in value(), c in value()) {
            if a.total_cmp(&b) != Ordering::Greater && b.total_cmp(&c) != Ordering::Greater {
                proptest::prop_assert_ne!(a.total_cmp(&c), Ordering::Greater);
            }
        }
    }
}
