mod common;

use std::sync::Arc;

use common::*;
use rand::prelude::*;
use snapdb::{I64Serializer, InsertOutcome, StoreConfig};

#[test]
fn test_empty_tree() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    assert_eq!(tree.nb_elems().unwrap(), 0);
    assert_eq!(tree.get(&1).unwrap(), None);
    assert!(collect_tuples(tree.browse().unwrap()).is_empty());
    assert_tree_ok(&t.db, "ints");
}

#[test]
fn test_single_insert_get() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    assert_eq!(tree.insert(42, 420).unwrap(), InsertOutcome::Inserted);
    assert_eq!(tree.get(&42).unwrap(), Some(420));
    assert_eq!(tree.get(&41).unwrap(), None);
    assert_eq!(tree.nb_elems().unwrap(), 1);
}

#[test]
fn test_root_leaf_splits_on_fifth_key() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    for k in 1..=4 {
        tree.insert(k, k * 10).unwrap();
    }
    // Still one leaf, which is the root.
    assert_eq!(assert_tree_ok(&t.db, "ints").depth, 0);

    // The fifth key splits the root leaf and grows the tree.
    tree.insert(5, 50).unwrap();
    let report = assert_tree_ok(&t.db, "ints");
    assert_eq!(report.depth, 1);
    assert_eq!(report.nb_elems, 5);

    let tuples = collect_tuples(tree.browse().unwrap());
    assert_eq!(tuples, vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
}

#[test]
fn test_replace_without_duplicates() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    tree.insert(7, 70).unwrap();
    match tree.insert(7, 71).unwrap() {
        InsertOutcome::Replaced(old) => assert_eq!(old, 70),
        other => panic!("expected Replaced, got {:?}", other),
    }
    assert_eq!(tree.get(&7).unwrap(), Some(71));
    assert_eq!(tree.nb_elems().unwrap(), 1);
}

#[test]
fn test_reinsert_same_pair_is_a_noop() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    tree.insert(7, 70).unwrap();
    let revision = t.db.revision();
    assert_eq!(tree.insert(7, 70).unwrap(), InsertOutcome::Exists);
    // No new revision was published for the no-op.
    assert_eq!(t.db.revision(), revision);
    assert_eq!(tree.nb_elems().unwrap(), 1);
}

#[test]
fn test_duplicate_values_share_a_key() {
    let t = new_db();
    let tree = string_dup_tree(&t.db);

    tree.insert(1, "cherry".to_string()).unwrap();
    assert_eq!(
        tree.insert(1, "apple".to_string()).unwrap(),
        InsertOutcome::Added
    );
    assert_eq!(
        tree.insert(1, "apple".to_string()).unwrap(),
        InsertOutcome::Exists
    );

    assert_eq!(
        tree.get_values(&1).unwrap(),
        Some(vec!["apple".to_string(), "cherry".to_string()])
    );
    assert!(tree.contains(&1, &"cherry".to_string()).unwrap());
    assert!(!tree.contains(&1, &"plum".to_string()).unwrap());
    // One key, two tuples.
    assert_eq!(tree.nb_elems().unwrap(), 1);
    assert_eq!(collect_tuples(tree.browse().unwrap()).len(), 2);
}

#[test]
fn test_value_set_overflows_into_value_tree() {
    let t = new_db_with(StoreConfig::default().with_value_inline_threshold(2));
    let tree = t
        .db
        .manage(
            "multi",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            true,
        )
        .unwrap();

    for v in [5, 1, 9, 3, 7, 2, 8] {
        tree.insert(10, v).unwrap();
    }

    assert_eq!(
        tree.get_values(&10).unwrap(),
        Some(vec![1, 2, 3, 5, 7, 8, 9])
    );
    assert!(tree.contains(&10, &9).unwrap());
    assert!(!tree.contains(&10, &4).unwrap());
    assert_eq!(tree.get(&10).unwrap(), Some(1));

    // The cursor expands the nested value tree in order.
    let tuples = collect_tuples(tree.browse().unwrap());
    assert_eq!(
        tuples,
        vec![(10, 1), (10, 2), (10, 3), (10, 5), (10, 7), (10, 8), (10, 9)]
    );
    assert_tree_ok(&t.db, "multi");
}

#[test]
fn test_browse_from_positions_at_floor() {
    let t = new_db();
    let tree = small_int_tree(&t.db);
    for k in [10, 20, 30, 40, 50, 60] {
        tree.insert(k, k).unwrap();
    }

    let mut cursor = tree.browse_from(&25).unwrap();
    assert_eq!(cursor.next_tuple().unwrap(), Some((30, 30)));
    assert_eq!(cursor.next_tuple().unwrap(), Some((40, 40)));

    // An exact hit starts on the key itself.
    let mut cursor = tree.browse_from(&30).unwrap();
    assert_eq!(cursor.next_tuple().unwrap(), Some((30, 30)));
}

#[test]
fn test_backward_browse() {
    let t = new_db();
    let tree = small_int_tree(&t.db);
    for k in 1..=9 {
        tree.insert(k, k).unwrap();
    }

    let mut cursor = tree.browse_end().unwrap();
    let mut seen = Vec::new();
    while let Some((k, _)) = cursor.prev_tuple().unwrap() {
        seen.push(k);
    }
    assert_eq!(seen, vec![9, 8, 7, 6, 5, 4, 3, 2, 1]);
}

#[test]
fn test_random_inserts_browse_sorted() {
    let t = new_db();
    let tree = t
        .db
        .manage(
            "rand",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            16,
            false,
        )
        .unwrap();

    let mut rng = rand::thread_rng();
    let mut keys: Vec<i64> = (0..500).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        tree.insert(k, k * 2).unwrap();
    }

    let tuples = collect_tuples(tree.browse().unwrap());
    assert_eq!(tuples.len(), 500);
    for (i, (k, v)) in tuples.iter().enumerate() {
        assert_eq!(*k, i as i64);
        assert_eq!(*v, k * 2);
    }
    let report = assert_tree_ok(&t.db, "rand");
    assert_eq!(report.nb_elems, 500);
}

#[test]
fn test_deep_tree_stays_balanced() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    for k in 1..=200 {
        tree.insert(k, k).unwrap();
        if k % 50 == 0 {
            assert_tree_ok(&t.db, "ints");
        }
    }
    let report = assert_tree_ok(&t.db, "ints");
    assert_eq!(report.nb_elems, 200);
    assert!(report.depth >= 3, "200 keys at fanout 4 need depth >= 3");
}
