//! Merge properties across replicas and engines.

use crsync_protocol::{SiteId, Watermark};
use crsync_store::{ApplyOutcome, Database, MemoryEngine, RejectReason, StorageEngine};
use crsync_testkit::prelude::*;
use proptest::prelude::*;

fn write_all<D: Database>(db: &D, writes: &[CellWrite]) {
    for w in writes {
        db.write_local("todo", &w.pk, &w.cid, w.val.clone()).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Two replicas that exchange everything end up with the same cells,
    /// whichever pushes first.
    #[test]
    fn replicas_converge(
        a_writes in cell_writes_strategy(12),
        b_writes in cell_writes_strategy(12),
        a_first in any::<bool>(),
        batch in 1usize..5,
    ) {
        let engine = MemoryEngine::new();
        let a = engine.open(&room("a")).unwrap();
        let b = engine.open(&room("b")).unwrap();
        write_all(&a, &a_writes);
        write_all(&b, &b_writes);

        if a_first {
            prop_assert!(push_changes(&a, &b, batch).unwrap().is_accepted());
            prop_assert!(push_changes(&b, &a, batch).unwrap().is_accepted());
        } else {
            prop_assert!(push_changes(&b, &a, batch).unwrap().is_accepted());
            prop_assert!(push_changes(&a, &b, batch).unwrap().is_accepted());
        }

        prop_assert_eq!(snapshot(&a).unwrap(), snapshot(&b).unwrap());
    }

    /// Three replicas relaying through a hub converge.
    #[test]
    fn hub_relay_converges(
        a_writes in cell_writes_strategy(8),
        b_writes in cell_writes_strategy(8),
        c_writes in cell_writes_strategy(8),
    ) {
        let engine = MemoryEngine::new();
        let hub = engine.open(&room("hub")).unwrap();
        let peers = [
            engine.open(&room("a")).unwrap(),
            engine.open(&room("b")).unwrap(),
            engine.open(&room("c")).unwrap(),
        ];
        write_all(&peers[0], &a_writes);
        write_all(&peers[1], &b_writes);
        write_all(&peers[2], &c_writes);

        for peer in &peers {
            push_changes(peer, &hub, 3).unwrap();
        }
        for peer in &peers {
            push_changes(&hub, peer, 3).unwrap();
        }

        let expected = snapshot(&hub).unwrap();
        for peer in &peers {
            prop_assert_eq!(&snapshot(peer).unwrap(), &expected);
        }
    }

    /// Re-sending an accepted batch from its old watermark is rejected and
    /// leaves the receiver unchanged.
    #[test]
    fn replayed_batch_rejected(writes in cell_writes_strategy(10)) {
        prop_assume!(!writes.is_empty());
        let engine = MemoryEngine::new();
        let a = engine.open(&room("a")).unwrap();
        let b = engine.open(&room("b")).unwrap();
        write_all(&a, &writes);

        let batch = a.changes_since(Watermark::ZERO, &[], usize::MAX).unwrap();
        prop_assert!(b.apply_changeset(a.site_id(), Watermark::ZERO, &batch).unwrap().is_accepted());
        let version = b.db_version().unwrap();
        let before = snapshot(&b).unwrap();

        let outcome = b.apply_changeset(a.site_id(), Watermark::ZERO, &batch).unwrap();
        let rejected_out_of_order = matches!(
            outcome,
            ApplyOutcome::Rejected { reason: RejectReason::OutOfOrder { .. }, .. }
        );
        prop_assert!(rejected_out_of_order);
        prop_assert_eq!(b.db_version().unwrap(), version);
        prop_assert_eq!(snapshot(&b).unwrap(), before);
    }
}

#[test]
fn file_and_memory_agree() {
    let rooms = TempRooms::new();
    let engine = MemoryEngine::new();
    let file_db = rooms.open(&room("shared")).unwrap();
    let mem_db = engine.open(&room("shared")).unwrap();

    let origin = site(9);
    let batch = change_run(origin, 1, 5);
    for db in [&file_db as &dyn Database, &mem_db as &dyn Database] {
        let outcome = db.apply_changeset(origin, Watermark::ZERO, &batch).unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Accepted {
                last_seen: Watermark::new(5, 0),
                applied: 5,
            }
        );
    }
    assert_eq!(snapshot(&file_db).unwrap(), snapshot(&mem_db).unwrap());
    file_db.close().unwrap();

    // Replay reproduces the same state.
    let reopened = rooms.open(&room("shared")).unwrap();
    assert_eq!(snapshot(&reopened).unwrap(), snapshot(&mem_db).unwrap());
    assert_eq!(
        reopened.last_seen(&origin).unwrap(),
        mem_db.last_seen(&origin).unwrap()
    );
}

#[test]
fn relayed_changes_keep_origin() {
    let engine = MemoryEngine::new();
    let hub = engine.open(&room("hub")).unwrap();
    let client = engine.open(&room("client")).unwrap();
    let origin = SiteId::from_bytes([5; 16]);

    hub.apply_changeset(origin, Watermark::ZERO, &change_run(origin, 1, 2))
        .unwrap();
    push_changes(&hub, &client, 10).unwrap();

    let relayed = client
        .changes_since(Watermark::ZERO, &[], 10)
        .unwrap();
    assert_eq!(relayed.len(), 2);
    assert!(relayed.iter().all(|c| c.site_id == origin));
    // Excluding the origin hides its changes, whoever relayed them.
    assert!(client
        .changes_since(Watermark::ZERO, &[origin], 10)
        .unwrap()
        .is_empty());
}
