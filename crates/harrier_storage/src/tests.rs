#[cfg(test)]
mod catalog_tests {
    use std::sync::Arc;

    use harrier_common::types::{IndexSpec, RelationKind, TxnId};

    use crate::catalog::CatalogStore;
    use crate::index::IndexStore;
    use crate::invalidation::InvalidationBus;

    fn setup() -> (Arc<CatalogStore>, Arc<InvalidationBus>, Arc<IndexStore>) {
        let bus = Arc::new(InvalidationBus::new());
        let structures = Arc::new(IndexStore::new());
        let catalog = Arc::new(CatalogStore::new(bus.clone(), structures.clone()));
        (catalog, bus, structures)
    }

    #[test]
    fn test_uncommitted_entry_invisible_to_others() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();

        let txn = TxnId(1);
        let idx = catalog
            .create_index_entry(txn, table, "t_a_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();

        // Own transaction sees it; others do not.
        assert!(catalog.index_entry(idx, Some(txn)).is_some());
        assert!(catalog.index_entry(idx, None).is_none());
        assert!(catalog.index_entry(idx, Some(TxnId(2))).is_none());

        catalog.commit_txn(txn).unwrap();
        let committed = catalog.index_entry(idx, None).unwrap();
        assert!(!committed.live && !committed.ready && !committed.valid);
    }

    #[test]
    fn test_abort_discards_pending_ops() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();
        let txn = TxnId(1);
        let idx = catalog
            .create_index_entry(txn, table, "t_a_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.abort_txn(txn);
        assert!(catalog.index_entry(idx, None).is_none());
        assert!(catalog.table(table).unwrap().indexes.is_empty());
    }

    #[test]
    fn test_flag_promotion_order_enforced() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();
        let txn = TxnId(1);
        let idx = catalog
            .create_index_entry(txn, table, "t_a_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.commit_txn(txn).unwrap();

        // valid before ready must be rejected.
        assert!(catalog.set_valid(TxnId(2), idx).is_err());

        let txn2 = TxnId(3);
        catalog.set_ready(txn2, idx).unwrap();
        catalog.commit_txn(txn2).unwrap();
        let e = catalog.index_entry(idx, None).unwrap();
        assert!(e.live && e.ready && !e.valid);

        let txn3 = TxnId(4);
        catalog.set_valid(txn3, idx).unwrap();
        catalog.commit_txn(txn3).unwrap();
        assert!(catalog.index_entry(idx, None).unwrap().valid);
    }

    #[test]
    fn test_mark_dead_demotes_all_flags() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();
        let txn = TxnId(1);
        let idx = catalog
            .create_index_entry(txn, table, "t_a_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.set_ready(txn, idx).unwrap();
        catalog.set_valid(txn, idx).unwrap();
        catalog.commit_txn(txn).unwrap();

        let txn2 = TxnId(2);
        catalog.mark_dead(txn2, idx).unwrap();
        catalog.commit_txn(txn2).unwrap();
        let e = catalog.index_entry(idx, None).unwrap();
        assert!(!e.live && !e.ready && !e.valid);
    }

    #[test]
    fn test_swap_exchanges_names_and_clears_old_valid() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();

        let txn = TxnId(1);
        let old = catalog
            .create_index_entry(txn, table, "t_a_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.set_ready(txn, old).unwrap();
        catalog.set_valid(txn, old).unwrap();
        let new = catalog
            .create_index_entry(txn, table, "t_a_idx_ccnew0", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.set_ready(txn, new).unwrap();
        catalog.set_valid(txn, new).unwrap();
        catalog.commit_txn(txn).unwrap();

        let txn2 = TxnId(2);
        catalog.swap_identities(txn2, old, new).unwrap();
        catalog.commit_txn(txn2).unwrap();

        let old_e = catalog.index_entry(old, None).unwrap();
        let new_e = catalog.index_entry(new, None).unwrap();
        assert_eq!(new_e.name, "t_a_idx");
        assert_eq!(old_e.name, "t_a_idx_ccnew0");
        assert!(new_e.valid);
        assert!(!old_e.valid);
    }

    #[test]
    fn test_swap_rejects_invalid_shadow() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();
        let txn = TxnId(1);
        let old = catalog
            .create_index_entry(txn, table, "t_a_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.set_ready(txn, old).unwrap();
        catalog.set_valid(txn, old).unwrap();
        let new = catalog
            .create_index_entry(txn, table, "t_a_idx_ccnew0", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.commit_txn(txn).unwrap();

        assert!(catalog.swap_identities(TxnId(2), old, new).is_err());
    }

    #[test]
    fn test_later_ops_observe_earlier_renames_in_same_txn() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();

        let setup_txn = TxnId(1);
        let mut pairs = Vec::new();
        for (i, col) in [0usize, 1].iter().enumerate() {
            let old = catalog
                .create_index_entry(
                    setup_txn,
                    table,
                    &format!("t_idx{}", i),
                    IndexSpec::btree(vec![*col]),
                    None,
                )
                .unwrap();
            catalog.set_ready(setup_txn, old).unwrap();
            catalog.set_valid(setup_txn, old).unwrap();
            let new = catalog
                .create_index_entry(
                    setup_txn,
                    table,
                    &format!("t_idx{}_ccnew", i),
                    IndexSpec::btree(vec![*col]),
                    None,
                )
                .unwrap();
            catalog.set_ready(setup_txn, new).unwrap();
            catalog.set_valid(setup_txn, new).unwrap();
            pairs.push((old, new));
        }
        catalog.commit_txn(setup_txn).unwrap();

        // Both swaps buffered in one transaction; the second must see the
        // first's rename rather than a stale name.
        let swap_txn = TxnId(2);
        for (old, new) in &pairs {
            catalog.swap_identities(swap_txn, *old, *new).unwrap();
        }
        catalog.commit_txn(swap_txn).unwrap();
        assert_eq!(catalog.index_entry(pairs[0].1, None).unwrap().name, "t_idx0");
        assert_eq!(catalog.index_entry(pairs[1].1, None).unwrap().name, "t_idx1");
    }

    #[test]
    fn test_drop_batch_removes_entries_and_structures() {
        let (catalog, _, structures) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();
        let txn = TxnId(1);
        let a = catalog
            .create_index_entry(txn, table, "a", IndexSpec::btree(vec![0]), None)
            .unwrap();
        let b = catalog
            .create_index_entry(txn, table, "b", IndexSpec::btree(vec![1]), None)
            .unwrap();
        catalog.commit_txn(txn).unwrap();
        structures.create(a, false);
        structures.create(b, false);

        let txn2 = TxnId(2);
        catalog.drop_index(txn2, a).unwrap();
        catalog.drop_index(txn2, b).unwrap();
        catalog.commit_txn(txn2).unwrap();

        assert!(catalog.index_entry(a, None).is_none());
        assert!(catalog.index_entry(b, None).is_none());
        assert!(!structures.exists(a));
        assert!(!structures.exists(b));
        assert!(catalog.table(table).unwrap().indexes.is_empty());
    }

    #[test]
    fn test_invalidation_emitted_on_promotion() {
        let (catalog, bus, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();
        let txn = TxnId(1);
        let idx = catalog
            .create_index_entry(txn, table, "t_a_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        catalog.commit_txn(txn).unwrap();
        let before = bus.count(table);

        let txn2 = TxnId(2);
        catalog.set_ready(txn2, idx).unwrap();
        catalog.commit_txn(txn2).unwrap();
        assert_eq!(bus.count(table), before + 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (catalog, _, _) = setup();
        let table = catalog.create_table("t", RelationKind::Table).unwrap();
        let txn = TxnId(1);
        catalog
            .create_index_entry(txn, table, "same", IndexSpec::btree(vec![0]), None)
            .unwrap();
        // Pending names count too.
        assert!(catalog
            .create_index_entry(txn, table, "same", IndexSpec::btree(vec![1]), None)
            .is_err());
    }
}

#[cfg(test)]
mod heap_tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use harrier_common::types::{Datum, IndexSpec, RelationKind, Snapshot, TxnId};
    use parking_lot::Mutex;

    use crate::catalog::CatalogStore;
    use crate::heap::{HeapStore, XidStatus};
    use crate::index::{HeapBuilder, IndexStore, PhysicalBuilder};
    use crate::invalidation::InvalidationBus;

    /// Manual xid status oracle.
    #[derive(Default)]
    struct StubStatus {
        committed: Mutex<HashSet<TxnId>>,
        aborted: Mutex<HashSet<TxnId>>,
    }

    impl StubStatus {
        fn commit(&self, xid: TxnId) {
            self.committed.lock().insert(xid);
        }
        fn abort(&self, xid: TxnId) {
            self.aborted.lock().insert(xid);
        }
    }

    impl XidStatus for StubStatus {
        fn is_committed(&self, xid: TxnId) -> bool {
            self.committed.lock().contains(&xid)
        }
        fn is_aborted(&self, xid: TxnId) -> bool {
            self.aborted.lock().contains(&xid)
        }
    }

    struct Fixture {
        catalog: Arc<CatalogStore>,
        heap: Arc<HeapStore>,
        structures: Arc<IndexStore>,
        status: Arc<StubStatus>,
    }

    fn setup() -> Fixture {
        let bus = Arc::new(InvalidationBus::new());
        let structures = Arc::new(IndexStore::new());
        let catalog = Arc::new(CatalogStore::new(bus, structures.clone()));
        let status = Arc::new(StubStatus::default());
        let heap = Arc::new(HeapStore::new(
            catalog.clone(),
            structures.clone(),
            status.clone(),
        ));
        Fixture {
            catalog,
            heap,
            structures,
            status,
        }
    }

    fn snapshot_after(committed_through: u64) -> Snapshot {
        Snapshot {
            xmin: TxnId(committed_through + 1),
            xmax: TxnId(committed_through + 1),
            in_progress: vec![],
        }
    }

    #[test]
    fn test_visibility_respects_commit_and_delete() {
        let f = setup();
        let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
        f.heap.create(table);

        let writer = TxnId(1);
        let rid = f.heap.insert(writer, table, vec![Datum::Int64(7)]).unwrap();

        // Uncommitted insert is invisible.
        assert!(f.heap.scan_visible(table, &snapshot_after(1)).unwrap().is_empty());

        f.status.commit(writer);
        let rows = f.heap.scan_visible(table, &snapshot_after(1)).unwrap();
        assert_eq!(rows.len(), 1);

        // Committed delete hides the row from later snapshots.
        let deleter = TxnId(2);
        f.heap.delete(deleter, table, rid).unwrap();
        f.status.commit(deleter);
        assert!(f.heap.scan_visible(table, &snapshot_after(2)).unwrap().is_empty());
        // But a snapshot from before the delete still sees it.
        let before_delete = Snapshot {
            xmin: TxnId(2),
            xmax: TxnId(2),
            in_progress: vec![],
        };
        assert_eq!(f.heap.scan_visible(table, &before_delete).unwrap().len(), 1);
    }

    #[test]
    fn test_aborted_insert_leaves_no_visible_row() {
        let f = setup();
        let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
        f.heap.create(table);
        let writer = TxnId(1);
        f.heap.insert(writer, table, vec![Datum::Int64(1)]).unwrap();
        f.status.abort(writer);
        assert!(f.heap.scan_visible(table, &snapshot_after(5)).unwrap().is_empty());
        assert_eq!(f.heap.raw_len(table), 1);
    }

    #[test]
    fn test_write_path_maintains_only_ready_indexes() {
        let f = setup();
        let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
        f.heap.create(table);

        let ddl = TxnId(1);
        let idx = f
            .catalog
            .create_index_entry(ddl, table, "t_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        f.catalog.commit_txn(ddl).unwrap();
        f.status.commit(ddl);
        f.structures.create(idx, false);

        // Not ready: insert does not touch it.
        let w1 = TxnId(2);
        f.heap.insert(w1, table, vec![Datum::Int64(1)]).unwrap();
        f.status.commit(w1);
        assert_eq!(f.structures.entry_count(idx), 0);

        let promote = TxnId(3);
        f.catalog.set_ready(promote, idx).unwrap();
        f.catalog.commit_txn(promote).unwrap();
        f.status.commit(promote);

        let w2 = TxnId(4);
        f.heap.insert(w2, table, vec![Datum::Int64(2)]).unwrap();
        f.status.commit(w2);
        assert_eq!(f.structures.entry_count(idx), 1);
    }

    #[test]
    fn test_unique_insert_conflicts_with_live_row() {
        let f = setup();
        let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
        f.heap.create(table);

        let ddl = TxnId(1);
        let idx = f
            .catalog
            .create_index_entry(ddl, table, "t_uq", IndexSpec::unique_btree(vec![0]), None)
            .unwrap();
        f.catalog.set_ready(ddl, idx).unwrap();
        f.catalog.commit_txn(ddl).unwrap();
        f.status.commit(ddl);
        f.structures.create(idx, true);

        let w1 = TxnId(2);
        f.heap.insert(w1, table, vec![Datum::Int64(42)]).unwrap();
        f.status.commit(w1);

        // Same key again: rejected even before the second txn resolves.
        let w2 = TxnId(3);
        let err = f.heap.insert(w2, table, vec![Datum::Int64(42)]).unwrap_err();
        assert!(format!("{}", err).contains("Unique constraint"));

        // A different key is fine.
        let w3 = TxnId(4);
        f.heap.insert(w3, table, vec![Datum::Int64(43)]).unwrap();
    }

    #[test]
    fn test_bulk_build_and_catch_up() {
        let f = setup();
        let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
        f.heap.create(table);

        for i in 0..3 {
            let w = TxnId(1 + i);
            f.heap.insert(w, table, vec![Datum::Int64(i as i64)]).unwrap();
            f.status.commit(w);
        }

        let ddl = TxnId(10);
        let idx = f
            .catalog
            .create_index_entry(ddl, table, "t_idx", IndexSpec::btree(vec![0]), None)
            .unwrap();
        f.catalog.commit_txn(ddl).unwrap();
        f.status.commit(ddl);
        let entry = f.catalog.index_entry(idx, None).unwrap();

        let builder = HeapBuilder::new(f.heap.clone(), f.structures.clone());
        let built = builder.build(table, &entry, &snapshot_after(9)).unwrap();
        assert_eq!(built, 3);

        // A row committed after the base snapshot is picked up by catch-up.
        let late = TxnId(11);
        f.heap.insert(late, table, vec![Datum::Int64(99)]).unwrap();
        f.status.commit(late);
        let caught = builder.catch_up(table, &entry, &snapshot_after(11)).unwrap();
        assert_eq!(caught, 1);
        assert_eq!(f.structures.entry_count(idx), 4);

        // Catch-up is idempotent.
        let again = builder.catch_up(table, &entry, &snapshot_after(11)).unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_partial_index_build_skips_non_matching_rows() {
        let f = setup();
        let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
        f.heap.create(table);

        let w = TxnId(1);
        f.heap
            .insert(w, table, vec![Datum::Int64(1), Datum::Text("x".into())])
            .unwrap();
        f.heap.insert(w, table, vec![Datum::Int64(2), Datum::Null]).unwrap();
        f.status.commit(w);

        let spec = IndexSpec {
            predicate: Some(harrier_common::types::IndexPredicate::NotNull(1)),
            ..IndexSpec::btree(vec![0])
        };
        let ddl = TxnId(2);
        let idx = f
            .catalog
            .create_index_entry(ddl, table, "t_part", spec, None)
            .unwrap();
        f.catalog.commit_txn(ddl).unwrap();
        f.status.commit(ddl);
        let entry = f.catalog.index_entry(idx, None).unwrap();

        let builder = HeapBuilder::new(f.heap.clone(), f.structures.clone());
        assert_eq!(builder.build(table, &entry, &snapshot_after(2)).unwrap(), 1);
    }

    /// Two uncommitted writers racing on the same unique key: the check
    /// and the entry insert share one lock acquisition, so exactly one of
    /// them can ever get through.
    #[test]
    fn test_concurrent_duplicate_inserts_admit_one() {
        for round in 0..300 {
            let f = setup();
            let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
            f.heap.create(table);

            let ddl = TxnId(1);
            let idx = f
                .catalog
                .create_index_entry(ddl, table, "t_uq", IndexSpec::unique_btree(vec![0]), None)
                .unwrap();
            f.catalog.set_ready(ddl, idx).unwrap();
            f.catalog.commit_txn(ddl).unwrap();
            f.status.commit(ddl);
            f.structures.create(idx, true);

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [TxnId(2), TxnId(3)]
                .into_iter()
                .map(|xid| {
                    let heap = f.heap.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        heap.insert(xid, table, vec![Datum::Int64(9)])
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let accepted = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(accepted, 1, "round {}: {:?}", round, results);
            assert!(results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .any(|e| format!("{}", e).contains("Unique constraint")));
            assert_eq!(f.structures.entry_count(idx), 1);
        }
    }

    /// A catch-up pass racing a write-path insert of the same unique key:
    /// whichever reaches the structure first wins, the other sees the
    /// conflict. They can never both succeed.
    #[test]
    fn test_catch_up_racing_writer_admits_one_key() {
        for round in 0..200 {
            let f = setup();
            let table = f.catalog.create_table("t", RelationKind::Table).unwrap();
            f.heap.create(table);

            // A committed row that predates the index and is missing from
            // its structure, exactly what catch-up exists to repair.
            let seed = TxnId(1);
            f.heap.insert(seed, table, vec![Datum::Int64(5)]).unwrap();
            f.status.commit(seed);

            let ddl = TxnId(2);
            let idx = f
                .catalog
                .create_index_entry(ddl, table, "t_uq", IndexSpec::unique_btree(vec![0]), None)
                .unwrap();
            f.catalog.set_ready(ddl, idx).unwrap();
            f.catalog.commit_txn(ddl).unwrap();
            f.status.commit(ddl);
            f.structures.create(idx, true);
            let entry = f.catalog.index_entry(idx, None).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let catcher = {
                let heap = f.heap.clone();
                let structures = f.structures.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let builder = HeapBuilder::new(heap, structures);
                    barrier.wait();
                    builder.catch_up(table, &entry, &snapshot_after(2)).map(|_| ())
                })
            };
            let writer = {
                let heap = f.heap.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    heap.insert(TxnId(3), table, vec![Datum::Int64(5)]).map(|_| ())
                })
            };

            let results = [catcher.join().unwrap(), writer.join().unwrap()];
            let accepted = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(accepted, 1, "round {}: {:?}", round, results);
            assert_eq!(f.structures.entry_count(idx), 1);
        }
    }
}
