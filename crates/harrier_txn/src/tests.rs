#[cfg(test)]
mod lock_manager_tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use harrier_common::config::DdlConfig;
    use harrier_common::types::{LockMode, LockScope, LockTag, RelationId};
    use harrier_storage::catalog::CatalogStore;
    use harrier_storage::index::IndexStore;
    use harrier_storage::invalidation::InvalidationBus;

    use crate::lock::LockManager;
    use crate::manager::TxnManager;

    fn setup() -> (Arc<LockManager>, Arc<TxnManager>) {
        let bus = Arc::new(InvalidationBus::new());
        let structures = Arc::new(IndexStore::new());
        let catalog = Arc::new(CatalogStore::new(bus, structures));
        let locks = Arc::new(LockManager::new(DdlConfig::default()));
        let txns = Arc::new(TxnManager::new(catalog, locks.clone()));
        (locks, txns)
    }

    fn setup_with_timeout(ms: u64) -> (Arc<LockManager>, Arc<TxnManager>) {
        let bus = Arc::new(InvalidationBus::new());
        let structures = Arc::new(IndexStore::new());
        let catalog = Arc::new(CatalogStore::new(bus, structures));
        let config = DdlConfig {
            lock_timeout_ms: ms,
            ..DdlConfig::default()
        };
        let locks = Arc::new(LockManager::new(config));
        let txns = Arc::new(TxnManager::new(catalog, locks.clone()));
        (locks, txns)
    }

    const TAG: LockTag = LockTag(RelationId(100));

    #[test]
    fn test_compatible_modes_coexist() {
        let (locks, txns) = setup();
        let s1 = txns.new_session();
        let s2 = txns.new_session();
        txns.begin(&s1).unwrap();
        txns.begin(&s2).unwrap();

        // Writer and concurrent-DDL lock do not conflict.
        locks
            .acquire(&s1, TAG, LockMode::RowExclusive, LockScope::Transaction)
            .unwrap();
        locks
            .acquire(&s2, TAG, LockMode::ShareUpdateExclusive, LockScope::Session)
            .unwrap();
        assert_eq!(locks.held_count(s1.backend()), 1);
        assert_eq!(locks.session_lock_count(s2.backend()), 1);
    }

    #[test]
    fn test_conflicting_acquire_blocks_until_release() {
        let (locks, txns) = setup();
        let s1 = txns.new_session();
        txns.begin(&s1).unwrap();
        locks
            .acquire(&s1, TAG, LockMode::RowExclusive, LockScope::Transaction)
            .unwrap();

        let locks2 = locks.clone();
        let txns2 = txns.clone();
        let handle = thread::spawn(move || {
            let s2 = txns2.new_session();
            txns2.begin(&s2).unwrap();
            // Share conflicts with RowExclusive; blocks until s1 ends.
            locks2
                .acquire(&s2, TAG, LockMode::Share, LockScope::Transaction)
                .unwrap();
            true
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        txns.commit(&s1).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_acquire_times_out_with_conflict_holder_count() {
        let (locks, txns) = setup_with_timeout(40);
        let s1 = txns.new_session();
        let s2 = txns.new_session();
        txns.begin(&s1).unwrap();
        txns.begin(&s2).unwrap();
        locks
            .acquire(&s1, TAG, LockMode::AccessExclusive, LockScope::Transaction)
            .unwrap();
        let err = locks
            .acquire(&s2, TAG, LockMode::AccessShare, LockScope::Transaction)
            .unwrap_err();
        assert!(format!("{}", err).contains("Timed out"));
    }

    #[test]
    fn test_cancel_unblocks_acquire() {
        let (locks, txns) = setup();
        let s1 = txns.new_session();
        txns.begin(&s1).unwrap();
        locks
            .acquire(&s1, TAG, LockMode::AccessExclusive, LockScope::Transaction)
            .unwrap();

        let s2 = txns.new_session();
        txns.begin(&s2).unwrap();
        let s2_thread = s2.clone();
        let locks2 = locks.clone();
        let handle = thread::spawn(move || {
            locks2.acquire(&s2_thread, TAG, LockMode::AccessShare, LockScope::Transaction)
        });
        thread::sleep(Duration::from_millis(30));
        s2.cancel();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, harrier_common::error::LockError::Cancelled));
    }

    #[test]
    fn test_transaction_scope_released_on_commit_session_scope_survives() {
        let (locks, txns) = setup();
        let s1 = txns.new_session();
        txns.begin(&s1).unwrap();
        locks
            .acquire(&s1, TAG, LockMode::RowExclusive, LockScope::Transaction)
            .unwrap();
        let mut guard = locks
            .acquire_session(&s1, TAG, LockMode::ShareUpdateExclusive)
            .unwrap();
        txns.commit(&s1).unwrap();

        assert_eq!(locks.held_count(s1.backend()), 1);
        assert_eq!(locks.session_lock_count(s1.backend()), 1);

        guard.release();
        assert_eq!(locks.held_count(s1.backend()), 0);

        // Idempotent.
        guard.release();
        assert_eq!(locks.held_count(s1.backend()), 0);
    }

    #[test]
    fn test_conflicting_holders_reports_other_backends_only() {
        let (locks, txns) = setup();
        let s1 = txns.new_session();
        let s2 = txns.new_session();
        txns.begin(&s1).unwrap();
        txns.begin(&s2).unwrap();
        locks
            .acquire(&s1, TAG, LockMode::RowExclusive, LockScope::Transaction)
            .unwrap();
        locks
            .acquire(&s2, TAG, LockMode::RowExclusive, LockScope::Transaction)
            .unwrap();

        let holders = locks.conflicting_holders(&[TAG], LockMode::Share, s1.backend());
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0], s2.current_vxid().unwrap());

        // AccessShare conflicts with neither writer.
        assert!(locks
            .conflicting_holders(&[TAG], LockMode::AccessShare, s1.backend())
            .is_empty());
    }
}

#[cfg(test)]
mod txn_manager_tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use harrier_common::cancel::CancelToken;
    use harrier_common::config::DdlConfig;
    use harrier_common::error::LockError;
    use harrier_storage::catalog::CatalogStore;
    use harrier_storage::heap::XidStatus;
    use harrier_storage::index::IndexStore;
    use harrier_storage::invalidation::InvalidationBus;

    use crate::lock::LockManager;
    use crate::manager::TxnManager;
    use crate::snapshot::SnapshotTracker;

    fn setup() -> (Arc<TxnManager>, SnapshotTracker) {
        let bus = Arc::new(InvalidationBus::new());
        let structures = Arc::new(IndexStore::new());
        let catalog = Arc::new(CatalogStore::new(bus, structures));
        let locks = Arc::new(LockManager::new(DdlConfig::default()));
        let txns = Arc::new(TxnManager::new(catalog, locks));
        let tracker = SnapshotTracker::new(txns.clone());
        (txns, tracker)
    }

    #[test]
    fn test_lifecycle_and_status() {
        let (txns, _) = setup();
        let s = txns.new_session();

        let xid = txns.begin(&s).unwrap();
        assert!(!txns.is_committed(xid) && !txns.is_aborted(xid));
        assert!(txns.begin(&s).is_err());

        txns.commit(&s).unwrap();
        assert!(txns.is_committed(xid));
        assert!(s.current_xid().is_none());

        let xid2 = txns.begin(&s).unwrap();
        txns.abort(&s).unwrap();
        assert!(txns.is_aborted(xid2));
    }

    #[test]
    fn test_snapshot_sees_in_flight_set() {
        let (txns, tracker) = setup();
        let s1 = txns.new_session();
        let s2 = txns.new_session();

        let x1 = txns.begin(&s1).unwrap();
        let x2 = txns.begin(&s2).unwrap();

        let snap = tracker.take(&s1).unwrap();
        assert_eq!(snap.xmin, x1.min(x2));
        assert!(snap.in_progress.contains(&x1));
        assert!(snap.in_progress.contains(&x2));
        assert!(!snap.might_see(x2));

        txns.commit(&s2).unwrap();
        // The old snapshot still excludes x2; a new one sees it.
        assert!(!snap.might_see(x2));
        assert!(tracker.take(&s1).unwrap().might_see(x2));
        txns.commit(&s1).unwrap();
    }

    #[test]
    fn test_registered_snapshot_pins_xmin() {
        let (txns, tracker) = setup();
        let s1 = txns.new_session();
        let s2 = txns.new_session();

        txns.begin(&s1).unwrap();
        let snap = tracker.take(&s1).unwrap();
        tracker.register(&s1, &snap).unwrap();

        txns.begin(&s2).unwrap();
        let infos = tracker.active_backends(&s2);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].xmin, Some(snap.xmin));

        tracker.unregister(&s1);
        // The plain snapshot xmin remains reported.
        let infos = tracker.active_backends(&s2);
        assert_eq!(infos[0].xmin, Some(snap.xmin));
    }

    #[test]
    fn test_vacuum_sessions_are_flagged() {
        let (txns, tracker) = setup();
        let vac = txns.new_vacuum_session();
        let s = txns.new_session();
        txns.begin(&vac).unwrap();
        txns.begin(&s).unwrap();
        let infos = tracker.active_backends(&s);
        assert_eq!(infos.len(), 1);
        assert!(infos[0].is_vacuum);
    }

    #[test]
    fn test_wait_for_vxid_end_blocks_then_returns() {
        let (txns, _) = setup();
        let s = txns.new_session();
        txns.begin(&s).unwrap();
        let vxid = s.current_vxid().unwrap();

        let txns2 = txns.clone();
        let handle = thread::spawn(move || {
            txns2.wait_for_vxid_end(vxid, &CancelToken::new(), Duration::from_millis(5))
        });
        thread::sleep(Duration::from_millis(40));
        assert!(!handle.is_finished());

        txns.abort(&s).unwrap();
        assert!(handle.join().unwrap().is_ok());

        // Already ended: returns immediately.
        txns.wait_for_vxid_end(vxid, &CancelToken::new(), Duration::from_millis(5))
            .unwrap();
    }

    #[test]
    fn test_wait_for_vxid_end_cancellable() {
        let (txns, _) = setup();
        let s = txns.new_session();
        txns.begin(&s).unwrap();
        let vxid = s.current_vxid().unwrap();

        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        let txns2 = txns.clone();
        let handle = thread::spawn(move || {
            txns2.wait_for_vxid_end(vxid, &cancel2, Duration::from_millis(5))
        });
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), Err(LockError::Cancelled)));
        txns.abort(&s).unwrap();
    }
}
