mod common;

use std::thread;
use std::time::Duration;

use common::*;
use snapdb::SnapError;

#[test]
fn test_commits_are_totally_ordered() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    let mut last = t.db.revision();
    for k in 1..=5 {
        tree.insert(k, k).unwrap();
        let now = t.db.revision();
        assert!(now > last, "revision must grow with every commit");
        last = now;
    }
}

#[test]
fn test_snapshot_isolation() {
    let t = new_db_with(eager_config().with_read_timeout(Duration::from_secs(60)));
    let tree = small_int_tree(&t.db);
    for k in 1..=10 {
        tree.insert(k, k).unwrap();
    }

    // Pin a snapshot, then delete everything behind its back.
    let cursor = tree.browse().unwrap();
    for k in 1..=10 {
        tree.delete(&k).unwrap();
    }
    assert_eq!(tree.nb_elems().unwrap(), 0);

    // The pinned cursor still sees the full content.
    let old = collect_tuples(cursor);
    assert_eq!(old.len(), 10);

    // A fresh snapshot sees the empty tree.
    assert!(collect_tuples(tree.browse().unwrap()).is_empty());
}

#[test]
fn test_shared_snapshot_across_trees() {
    let t = new_db();
    let ints = small_int_tree(&t.db);
    let tags = string_dup_tree(&t.db);
    ints.insert(1, 10).unwrap();
    tags.insert(1, "one".to_string()).unwrap();

    let rt = t.db.begin_read();
    ints.insert(2, 20).unwrap();
    tags.insert(2, "two".to_string()).unwrap();

    // Both trees read as of the shared snapshot.
    assert_eq!(collect_tuples(ints.browse_with(&rt).unwrap()).len(), 1);
    assert_eq!(collect_tuples(tags.browse_with(&rt).unwrap()).len(), 1);
    rt.close();
}

#[test]
fn test_browse_at_historical_revision() {
    let t = new_db_with(eager_config());
    let tree = small_int_tree(&t.db);

    tree.insert(1, 10).unwrap();
    let after_one = tree.revision().unwrap();
    tree.insert(2, 20).unwrap();
    tree.insert(3, 30).unwrap();

    let cursor = tree
        .browse_at(after_one)
        .unwrap()
        .expect("revision still on disk");
    assert_eq!(collect_tuples(cursor), vec![(1, 10)]);

    // A revision from before the tree existed yields nothing.
    assert!(tree.browse_at(0).unwrap().is_none());
}

#[test]
fn test_reaper_closes_expired_readers() {
    let t = new_db_with(eager_config());
    let tree = small_int_tree(&t.db);
    tree.insert(1, 10).unwrap();

    let rt = t.db.begin_read();
    assert!(!rt.is_closed());
    thread::sleep(Duration::from_millis(400));
    assert!(rt.is_closed(), "reaper should have closed the reader");

    match tree.get_with(&rt, &1) {
        Err(SnapError::StaleRead) => {}
        other => panic!("expected StaleRead, got {:?}", other),
    }
}

#[test]
fn test_reclaim_returns_pages_to_the_free_list() {
    let t = new_db_with(eager_config());
    let tree = small_int_tree(&t.db);

    for k in 1..=20 {
        tree.insert(k, k).unwrap();
    }
    for k in 1..=20 {
        tree.insert(k, k + 1).unwrap();
    }

    let freed = t.db.reclaim_now().unwrap();
    assert!(freed > 0, "copy-on-write must have left garbage to reclaim");

    let report = snapdb::inspector::check_store(&t.db).unwrap();
    assert!(report.free_pages > 0);
    assert_eq!(report.orphan_pages, 0);

    // Free pages get reused: rewriting everything again should not grow
    // the file much past its current size.
    let size_before = t.db.file_size();
    for k in 1..=20 {
        tree.insert(k, k + 2).unwrap();
    }
    t.db.reclaim_now().unwrap();
    let growth = t.db.file_size() - size_before;
    assert!(
        growth < size_before / 2,
        "rewrites should mostly reuse reclaimed pages (grew {} of {})",
        growth,
        size_before
    );
}

#[test]
fn test_reclaim_spares_live_readers() {
    let t = new_db_with(eager_config().with_read_timeout(Duration::from_secs(60)));
    let tree = small_int_tree(&t.db);
    for k in 1..=10 {
        tree.insert(k, k).unwrap();
    }

    let pinned = tree.revision().unwrap();
    let cursor = tree.browse().unwrap();

    for k in 1..=10 {
        tree.insert(k, k * 100).unwrap();
    }
    t.db.reclaim_now().unwrap();

    // The reader's pages survived the reclamation.
    let old = collect_tuples(cursor);
    assert_eq!(old, (1..=10).map(|k| (k, k)).collect::<Vec<_>>());

    // Once the reader is gone, the old revision can be swept away.
    t.db.reclaim_now().unwrap();
    assert!(tree.browse_at(pinned).unwrap().is_none());
}

#[test]
fn test_concurrent_readers_and_writer() {
    let t = new_db_with(eager_config().with_read_timeout(Duration::from_secs(60)));
    let tree = small_int_tree(&t.db);
    for k in 1..=50 {
        tree.insert(k, k).unwrap();
    }

    thread::scope(|scope| {
        // Readers iterate their snapshots while the writer churns.
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..20 {
                    let tuples = collect_tuples(tree.browse().unwrap());
                    assert!(tuples.len() >= 50);
                    // Within one snapshot the keys are always sorted.
                    for pair in tuples.windows(2) {
                        assert!(pair[0].0 < pair[1].0);
                    }
                }
            });
        }
        scope.spawn(|| {
            for k in 51..=150 {
                tree.insert(k, k).unwrap();
            }
        });
    });

    assert_eq!(tree.nb_elems().unwrap(), 150);
    assert_tree_ok(&t.db, "ints");
}
