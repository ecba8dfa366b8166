//! In-memory room state and merge rules shared by both engines.
//!
//! Every cell is a last-writer-wins register keyed by `(table, pk, cid)`.
//! A higher `col_version` wins; equal versions fall back to
//! [`Value::total_cmp`], so replicas converge regardless of arrival order.

use crate::engine::RejectReason;
use crate::error::{StoreError, StoreResult};
use crsync_protocol::{Change, Schema, SiteId, Value, Watermark};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CellKey {
    table: String,
    pk: Vec<u8>,
    cid: String,
}

#[derive(Debug, Clone)]
struct Cell {
    val: Value,
    col_version: u64,
    /// Local position of the winning write.
    at: Watermark,
    site_id: SiteId,
}

/// Materialized state of one room.
#[derive(Debug)]
pub(crate) struct RoomState {
    site_id: SiteId,
    db_version: u64,
    schema: Option<Schema>,
    cells: BTreeMap<CellKey, Cell>,
    // Exactly one entry per cell, keyed by the cell's local watermark.
    by_version: BTreeMap<Watermark, CellKey>,
    peers: HashMap<SiteId, Watermark>,
}

impl RoomState {
    pub(crate) fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            db_version: 0,
            schema: None,
            cells: BTreeMap::new(),
            by_version: BTreeMap::new(),
            peers: HashMap::new(),
        }
    }

    pub(crate) fn site_id(&self) -> SiteId {
        self.site_id
    }

    pub(crate) fn db_version(&self) -> u64 {
        self.db_version
    }

    pub(crate) fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub(crate) fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Peers in site id order.
    pub(crate) fn peers(&self) -> Vec<(SiteId, Watermark)> {
        let mut peers: Vec<_> = self.peers.iter().map(|(s, w)| (*s, *w)).collect();
        peers.sort();
        peers
    }

    pub(crate) fn last_seen(&self, peer: &SiteId) -> Watermark {
        self.peers.get(peer).copied().unwrap_or(Watermark::ZERO)
    }

    /// Returns true if `schema` still has to be recorded.
    pub(crate) fn check_schema(&self, schema: &Schema) -> StoreResult<bool> {
        match &self.schema {
            None => Ok(true),
            Some(current) if current == schema => Ok(false),
            Some(current) => Err(StoreError::SchemaMismatch {
                expected: current.clone(),
                found: schema.clone(),
            }),
        }
    }

    pub(crate) fn set_schema(&mut self, schema: Schema) {
        self.schema = Some(schema);
    }

    /// Checks a changeset without touching state.
    pub(crate) fn validate(
        &self,
        sender: &SiteId,
        since: Watermark,
        changes: &[Change],
    ) -> Result<(), RejectReason> {
        let expected = self.last_seen(sender);
        if since != expected {
            return Err(RejectReason::OutOfOrder {
                expected,
                got: since,
            });
        }

        if *sender == self.site_id {
            return Err(RejectReason::Malformed(
                "changes claim to come from this replica".into(),
            ));
        }

        let mut prev = since;
        for (i, change) in changes.iter().enumerate() {
            if change.table.is_empty() {
                return Err(RejectReason::Malformed(format!("change {i} has no table")));
            }
            if change.cid.is_empty() {
                return Err(RejectReason::Malformed(format!("change {i} has no column")));
            }
            if change.col_version == 0 {
                return Err(RejectReason::Malformed(format!(
                    "change {i} has column version 0"
                )));
            }
            let at = change.watermark();
            if at <= prev {
                return Err(RejectReason::Malformed(format!(
                    "change {i} at {at} does not follow {prev}"
                )));
            }
            prev = at;
        }
        Ok(())
    }

    /// Merges a validated changeset. Returns the number of winning changes.
    ///
    /// All winners share one new local version.
    pub(crate) fn apply(&mut self, sender: SiteId, changes: &[Change]) -> usize {
        let version = self.db_version + 1;
        let mut seq = 0u32;

        for change in changes {
            let key = CellKey {
                table: change.table.clone(),
                pk: change.pk.clone(),
                cid: change.cid.clone(),
            };
            let wins = match self.cells.get(&key) {
                None => true,
                Some(existing) => incoming_wins(change, existing),
            };
            if wins {
                self.set_cell(
                    key,
                    Cell {
                        val: change.val.clone(),
                        col_version: change.col_version,
                        at: Watermark::new(version, seq),
                        site_id: change.site_id,
                    },
                );
                seq += 1;
            }
        }

        if seq > 0 {
            self.db_version = version;
        }
        if let Some(last) = changes.last() {
            self.peers.insert(sender, last.watermark());
        }
        seq as usize
    }

    pub(crate) fn write_local(&mut self, table: &str, pk: &[u8], cid: &str, val: Value) -> Change {
        let key = CellKey {
            table: table.to_string(),
            pk: pk.to_vec(),
            cid: cid.to_string(),
        };
        let col_version = self.cells.get(&key).map_or(1, |c| c.col_version + 1);
        self.db_version += 1;
        let at = Watermark::new(self.db_version, 0);
        let cell = Cell {
            val,
            col_version,
            at,
            site_id: self.site_id,
        };
        let change = to_change(&key, &cell);
        self.set_cell(key, cell);
        change
    }

    pub(crate) fn changes_since(
        &self,
        since: Watermark,
        exclude: &[SiteId],
        limit: usize,
    ) -> Vec<Change> {
        self.by_version
            .range((Bound::Excluded(since), Bound::Unbounded))
            .filter_map(|(_, key)| {
                let cell = self.cells.get(key)?;
                if exclude.contains(&cell.site_id) {
                    return None;
                }
                Some(to_change(key, cell))
            })
            .take(limit)
            .collect()
    }

    fn set_cell(&mut self, key: CellKey, cell: Cell) {
        if let Some(old) = self.cells.get(&key) {
            self.by_version.remove(&old.at);
        }
        self.by_version.insert(cell.at, key.clone());
        self.cells.insert(key, cell);
    }
}

fn incoming_wins(incoming: &Change, existing: &Cell) -> bool {
    match incoming.col_version.cmp(&existing.col_version) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => incoming.val.total_cmp(&existing.val) == Ordering::Greater,
    }
}

fn to_change(key: &CellKey, cell: &Cell) -> Change {
    Change {
        table: key.table.clone(),
        pk: key.pk.clone(),
        cid: key.cid.clone(),
        val: cell.val.clone(),
        col_version: cell.col_version,
        db_version: cell.at.db_version,
        seq: cell.at.seq,
        site_id: cell.site_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: SiteId = SiteId::from_bytes([0; 16]);
    const PEER: SiteId = SiteId::from_bytes([1; 16]);
    const OTHER: SiteId = SiteId::from_bytes([2; 16]);

    fn change(cid: &str, val: Value, col_version: u64, db_version: u64, seq: u32) -> Change {
        Change {
            table: "todo".into(),
            pk: vec![1],
            cid: cid.into(),
            val,
            col_version,
            db_version,
            seq,
            site_id: PEER,
        }
    }

    #[test]
    fn apply_records_watermark_and_version() {
        let mut state = RoomState::new(LOCAL);
        let batch = vec![
            change("title", Value::Text("milk".into()), 1, 1, 0),
            change("done", Value::Integer(0), 1, 1, 1),
        ];
        state.validate(&PEER, Watermark::ZERO, &batch).unwrap();
        assert_eq!(state.apply(PEER, &batch), 2);
        assert_eq!(state.db_version(), 1);
        assert_eq!(state.last_seen(&PEER), Watermark::new(1, 1));

        let out = state.changes_since(Watermark::ZERO, &[], 10);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].watermark(), Watermark::new(1, 0));
        assert_eq!(out[1].watermark(), Watermark::new(1, 1));
        assert!(out.iter().all(|c| c.site_id == PEER));
    }

    #[test]
    fn out_of_order_rejected() {
        let state = RoomState::new(LOCAL);
        let batch = vec![change("title", Value::Null, 1, 5, 0)];
        let err = state.validate(&PEER, Watermark::new(4, 0), &batch).unwrap_err();
        assert_eq!(
            err,
            RejectReason::OutOfOrder {
                expected: Watermark::ZERO,
                got: Watermark::new(4, 0),
            }
        );
    }

    #[test]
    fn malformed_rejected() {
        let state = RoomState::new(LOCAL);

        let mut bad = change("title", Value::Null, 1, 1, 0);
        bad.table.clear();
        assert!(matches!(
            state.validate(&PEER, Watermark::ZERO, &[bad]),
            Err(RejectReason::Malformed(_))
        ));

        let zero = change("title", Value::Null, 0, 1, 0);
        assert!(state.validate(&PEER, Watermark::ZERO, &[zero]).is_err());

        let unordered = vec![
            change("a", Value::Null, 1, 2, 0),
            change("b", Value::Null, 1, 1, 0),
        ];
        assert!(state.validate(&PEER, Watermark::ZERO, &unordered).is_err());

        let own = change("a", Value::Null, 1, 1, 0);
        assert!(state.validate(&LOCAL, Watermark::ZERO, &[own]).is_err());
    }

    #[test]
    fn higher_col_version_wins() {
        let mut state = RoomState::new(LOCAL);
        state.apply(PEER, &[change("title", Value::Text("b".into()), 2, 1, 0)]);
        // Older write loses even with a larger value.
        let applied = state.apply(PEER, &[change("title", Value::Text("z".into()), 1, 2, 0)]);
        assert_eq!(applied, 0);
        assert_eq!(state.db_version(), 1);
        let out = state.changes_since(Watermark::ZERO, &[], 10);
        assert_eq!(out[0].val, Value::Text("b".into()));
    }

    #[test]
    fn tie_breaks_on_value() {
        let mut a = RoomState::new(LOCAL);
        let mut b = RoomState::new(OTHER);
        let x = change("title", Value::Text("x".into()), 3, 1, 0);
        let y = change("title", Value::Text("y".into()), 3, 2, 0);

        a.apply(PEER, &[x.clone()]);
        a.apply(PEER, &[y.clone()]);
        b.apply(PEER, &[y]);
        b.apply(PEER, &[x]);

        let va = a.changes_since(Watermark::ZERO, &[], 10);
        let vb = b.changes_since(Watermark::ZERO, &[], 10);
        assert_eq!(va[0].val, Value::Text("y".into()));
        assert_eq!(vb[0].val, Value::Text("y".into()));
    }

    #[test]
    fn reapply_is_noop() {
        let mut state = RoomState::new(LOCAL);
        let batch = vec![change("title", Value::Integer(7), 1, 1, 0)];
        assert_eq!(state.apply(PEER, &batch), 1);
        assert_eq!(state.apply(PEER, &batch), 0);
        assert_eq!(state.db_version(), 1);
        assert_eq!(state.cell_count(), 1);
    }

    #[test]
    fn changes_since_excludes_sites_and_limits() {
        let mut state = RoomState::new(LOCAL);
        state.apply(PEER, &[change("a", Value::Integer(1), 1, 1, 0)]);
        state.write_local("todo", &[2], "b", Value::Integer(2));
        state.write_local("todo", &[3], "c", Value::Integer(3));

        let local = state.changes_since(Watermark::ZERO, &[PEER], 10);
        assert_eq!(local.len(), 2);
        assert!(local.iter().all(|c| c.site_id == LOCAL));

        let first = state.changes_since(Watermark::ZERO, &[], 1);
        assert_eq!(first.len(), 1);
        let rest = state.changes_since(first[0].watermark(), &[], 10);
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn overwritten_cell_moves_forward() {
        let mut state = RoomState::new(LOCAL);
        let first = state.write_local("todo", &[1], "title", Value::Text("a".into()));
        let second = state.write_local("todo", &[1], "title", Value::Text("b".into()));
        assert_eq!(first.col_version, 1);
        assert_eq!(second.col_version, 2);

        let out = state.changes_since(Watermark::ZERO, &[], 10);
        assert_eq!(out, vec![second.clone()]);
        assert!(state
            .changes_since(second.watermark(), &[], 10)
            .is_empty());
    }

    #[test]
    fn schema_checks() {
        let mut state = RoomState::new(LOCAL);
        let schema = Schema::new("todo", 1);
        assert!(state.check_schema(&schema).unwrap());
        state.set_schema(schema.clone());
        assert!(!state.check_schema(&schema).unwrap());
        assert!(matches!(
            state.check_schema(&Schema::new("todo", 2)),
            Err(StoreError::SchemaMismatch { .. })
        ));
    }
}
