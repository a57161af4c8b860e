mod common;

use std::sync::Arc;

use common::*;
use rand::prelude::*;
use snapdb::{I64Serializer, StoreConfig};

#[test]
fn test_delete_absent_key() {
    let t = new_db();
    let tree = small_int_tree(&t.db);
    tree.insert(1, 10).unwrap();

    let revision = t.db.revision();
    assert_eq!(tree.delete(&99).unwrap(), None);
    // Nothing changed, nothing was committed.
    assert_eq!(t.db.revision(), revision);
    assert_eq!(tree.nb_elems().unwrap(), 1);
}

#[test]
fn test_delete_last_entry_keeps_the_tree() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    tree.insert(1, 10).unwrap();
    assert_eq!(tree.delete(&1).unwrap(), Some(vec![10]));
    assert_eq!(tree.get(&1).unwrap(), None);
    assert_eq!(tree.nb_elems().unwrap(), 0);
    assert_eq!(tree.delete(&1).unwrap(), None);

    // The empty root leaf still accepts new keys.
    tree.insert(2, 20).unwrap();
    assert_eq!(tree.get(&2).unwrap(), Some(20));
    assert_tree_ok(&t.db, "ints");
}

#[test]
fn test_plain_remove_then_borrow() {
    let t = new_db();
    let tree = t
        .db
        .bulk_load(
            "dense",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            false,
            (1..=10i64).map(|k| (k, k)),
        )
        .unwrap();

    // The middle leaf still has an entry to spare: plain copy-on-write.
    tree.delete(&6).unwrap();
    assert_tree_ok(&t.db, "dense");

    // Now it sits at the minimum; the next delete makes it borrow from
    // a sibling.
    tree.delete(&7).unwrap();
    let report = assert_tree_ok(&t.db, "dense");
    assert_eq!(report.nb_elems, 8);
    assert_eq!(report.depth, 1);

    let keys: Vec<i64> = collect_tuples(tree.browse().unwrap())
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 8, 9, 10]);
}

#[test]
fn test_merge_shrinks_height() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    for k in 1..=5 {
        tree.insert(k, k).unwrap();
    }
    assert_eq!(assert_tree_ok(&t.db, "ints").depth, 1);

    // Deleting down to a single key merges the leaves and collapses the
    // root back into a leaf.
    for k in [5, 4, 3, 2] {
        tree.delete(&k).unwrap();
        assert_tree_ok(&t.db, "ints");
    }
    let report = assert_tree_ok(&t.db, "ints");
    assert_eq!(report.depth, 0);
    assert_eq!(report.nb_elems, 1);
    assert_eq!(tree.get(&1).unwrap(), Some(1));
}

#[test]
fn test_delete_one_value_from_a_set() {
    let t = new_db();
    let tree = string_dup_tree(&t.db);

    tree.insert(1, "a".to_string()).unwrap();
    tree.insert(1, "b".to_string()).unwrap();
    tree.insert(1, "c".to_string()).unwrap();

    assert_eq!(
        tree.delete_value(&1, &"b".to_string()).unwrap(),
        Some("b".to_string())
    );
    assert_eq!(tree.delete_value(&1, &"b".to_string()).unwrap(), None);
    assert_eq!(
        tree.get_values(&1).unwrap(),
        Some(vec!["a".to_string(), "c".to_string()])
    );
    // The key itself is still there.
    assert_eq!(tree.nb_elems().unwrap(), 1);

    // Removing the last values removes the key.
    tree.delete_value(&1, &"a".to_string()).unwrap();
    tree.delete_value(&1, &"c".to_string()).unwrap();
    assert_eq!(tree.get(&1).unwrap(), None);
    assert_eq!(tree.nb_elems().unwrap(), 0);
}

#[test]
fn test_value_tree_folds_back_inline() {
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

    for v in 1..=6 {
        tree.insert(1, v).unwrap();
    }
    assert_tree_ok(&t.db, "multi");

    // Shrink the set below the threshold again.
    for v in [6, 5, 4, 3, 2] {
        tree.delete_value(&1, &v).unwrap();
        assert_tree_ok(&t.db, "multi");
    }
    assert_eq!(tree.get_values(&1).unwrap(), Some(vec![1]));
}

#[test]
fn test_delete_key_with_value_tree() {
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

    for v in 1..=10 {
        tree.insert(7, v).unwrap();
    }
    let removed = tree.delete(&7).unwrap().expect("key present");
    assert_eq!(removed, (1..=10).collect::<Vec<i64>>());
    assert_eq!(tree.get(&7).unwrap(), None);
    assert_tree_ok(&t.db, "multi");
}

#[test]
fn test_random_insert_delete_soak() {
    let t = new_db();
    let tree = small_int_tree(&t.db);

    let mut rng = rand::thread_rng();
    let mut keys: Vec<i64> = (0..300).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        tree.insert(k, k).unwrap();
    }

    // Delete a random half.
    keys.shuffle(&mut rng);
    let (gone, kept) = keys.split_at(150);
    for &k in gone {
        assert_eq!(tree.delete(&k).unwrap(), Some(vec![k]));
    }

    let mut expected: Vec<i64> = kept.to_vec();
    expected.sort_unstable();
    let found: Vec<i64> = collect_tuples(tree.browse().unwrap())
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(found, expected);

    let report = assert_tree_ok(&t.db, "ints");
    assert_eq!(report.nb_elems, 150);

    // And drain the rest.
    for &k in kept {
        tree.delete(&k).unwrap();
    }
    assert_eq!(tree.nb_elems().unwrap(), 0);
    assert_tree_ok(&t.db, "ints");
}
