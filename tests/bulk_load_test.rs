mod common;

use std::sync::Arc;

use common::*;
use rand::prelude::*;
use snapdb::{I64Serializer, SnapError, StoreConfig};

#[test]
fn test_dense_build_of_ten_keys() {
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

    // Ten keys at fanout 4: three leaves (4/3/3) under one root node.
    let report = assert_tree_ok(&t.db, "dense");
    assert_eq!(report.nb_elems, 10);
    assert_eq!(report.depth, 1);

    let tuples = collect_tuples(tree.browse().unwrap());
    assert_eq!(tuples, (1..=10).map(|k| (k, k)).collect::<Vec<_>>());
}

#[test]
fn test_bulk_single_leaf() {
    let t = new_db();
    let tree = t
        .db
        .bulk_load(
            "tiny",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            false,
            (1..=3i64).map(|k| (k, k)),
        )
        .unwrap();

    assert_eq!(assert_tree_ok(&t.db, "tiny").depth, 0);
    assert_eq!(tree.get(&2).unwrap(), Some(2));
}

#[test]
fn test_bulk_empty_input() {
    let t = new_db();
    let tree = t
        .db
        .bulk_load(
            "empty",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            false,
            std::iter::empty::<(i64, i64)>(),
        )
        .unwrap();

    assert_eq!(tree.nb_elems().unwrap(), 0);
    assert!(collect_tuples(tree.browse().unwrap()).is_empty());
    // And the empty tree accepts ordinary inserts afterwards.
    tree.insert(1, 1).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(1));
}

#[test]
fn test_bulk_sorts_and_groups_unsorted_input() {
    let t = new_db();
    let mut rng = rand::thread_rng();

    // Shuffled input with repeated keys and repeated exact pairs.
    let mut input: Vec<(i64, i64)> = Vec::new();
    for k in 0..50 {
        input.push((k, k * 2));
        input.push((k, k * 2 + 1));
        input.push((k, k * 2)); // exact duplicate collapses
    }
    input.shuffle(&mut rng);

    let tree = t
        .db
        .bulk_load(
            "grouped",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            8,
            true,
            input,
        )
        .unwrap();

    assert_eq!(tree.nb_elems().unwrap(), 50);
    let tuples = collect_tuples(tree.browse().unwrap());
    assert_eq!(tuples.len(), 100);
    for k in 0..50i64 {
        assert_eq!(
            tree.get_values(&k).unwrap(),
            Some(vec![k * 2, k * 2 + 1])
        );
    }
    assert_tree_ok(&t.db, "grouped");
}

#[test]
fn test_bulk_external_sort_path() {
    // A chunk of 16 forces the temp-file merge for 500 tuples.
    let t = new_db_with(StoreConfig::default().with_bulk_chunk_size(16));
    let mut rng = rand::thread_rng();
    let mut keys: Vec<i64> = (0..500).collect();
    keys.shuffle(&mut rng);

    let tree = t
        .db
        .bulk_load(
            "spilled",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            16,
            false,
            keys.iter().map(|&k| (k, k * 3)),
        )
        .unwrap();

    let tuples = collect_tuples(tree.browse().unwrap());
    assert_eq!(tuples.len(), 500);
    for (i, (k, v)) in tuples.iter().enumerate() {
        assert_eq!(*k, i as i64);
        assert_eq!(*v, k * 3);
    }
    assert_tree_ok(&t.db, "spilled");
}

#[test]
fn test_bulk_exact_chunk_boundary_stays_in_memory() {
    // Exactly one chunk: the loader must not spill.
    let t = new_db_with(StoreConfig::default().with_bulk_chunk_size(10));
    let tree = t
        .db
        .bulk_load(
            "boundary",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            false,
            (0..10i64).map(|k| (k, k)),
        )
        .unwrap();
    assert_eq!(tree.nb_elems().unwrap(), 10);
    assert_tree_ok(&t.db, "boundary");
}

#[test]
fn test_bulk_exact_chunk_boundary_spills() {
    // Two exact chunks: the loader must merge runs.
    let t = new_db_with(StoreConfig::default().with_bulk_chunk_size(10));
    let tree = t
        .db
        .bulk_load(
            "boundary2",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            false,
            (0..20i64).rev().map(|k| (k, k)),
        )
        .unwrap();
    assert_eq!(tree.nb_elems().unwrap(), 20);
    let tuples = collect_tuples(tree.browse().unwrap());
    assert_eq!(tuples, (0..20).map(|k| (k, k)).collect::<Vec<_>>());
    assert_tree_ok(&t.db, "boundary2");
}

#[test]
fn test_bulk_merges_key_across_chunks() {
    // The same key lands in two different runs; the merge joins the
    // value sets.
    let t = new_db_with(StoreConfig::default().with_bulk_chunk_size(4));
    let input = vec![
        (1i64, 1i64),
        (2, 2),
        (3, 3),
        (4, 4), // run one
        (1, 100),
        (5, 5),
        (6, 6),
        (7, 7), // run two, key 1 again
        (8, 8),
    ];
    let tree = t
        .db
        .bulk_load(
            "crossed",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            true,
            input,
        )
        .unwrap();

    assert_eq!(tree.nb_elems().unwrap(), 8);
    assert_eq!(tree.get_values(&1).unwrap(), Some(vec![1, 100]));
    assert_tree_ok(&t.db, "crossed");
}

#[test]
fn test_bulk_refuses_existing_name() {
    let t = new_db();
    small_int_tree(&t.db);
    let result = t.db.bulk_load(
        "ints",
        Arc::new(I64Serializer),
        Arc::new(I64Serializer),
        4,
        false,
        std::iter::empty::<(i64, i64)>(),
    );
    match result {
        Err(SnapError::BTreeAlreadyManaged(name)) => assert_eq!(name, "ints"),
        other => panic!("expected BTreeAlreadyManaged, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_bulk_conflicting_values_without_duplicates() {
    let t = new_db();
    let result = t.db.bulk_load(
        "conflict",
        Arc::new(I64Serializer),
        Arc::new(I64Serializer),
        4,
        false,
        vec![(1i64, 1i64), (1, 2)],
    );
    match result {
        Err(SnapError::DuplicateValueNotAllowed) => {}
        other => panic!("expected DuplicateValueNotAllowed, got {:?}", other.map(|_| ())),
    }
    // The failed load left nothing behind.
    assert!(!t.db.contains_tree("conflict"));
}

#[test]
fn test_bulk_large_value_sets_become_value_trees() {
    let t = new_db_with(StoreConfig::default().with_value_inline_threshold(2));
    let input: Vec<(i64, i64)> = (0..12).map(|v| (1i64, v)).collect();
    let tree = t
        .db
        .bulk_load(
            "fat",
            Arc::new(I64Serializer),
            Arc::new(I64Serializer),
            4,
            true,
            input,
        )
        .unwrap();

    assert_eq!(tree.get_values(&1).unwrap(), Some((0..12).collect::<Vec<_>>()));
    assert_tree_ok(&t.db, "fat");
}

#[test]
fn test_bulk_minimal_height() {
    let t = new_db();
    t.db.bulk_load(
        "big",
        Arc::new(I64Serializer),
        Arc::new(I64Serializer),
        4,
        false,
        (0..1000i64).map(|k| (k, k)),
    )
    .unwrap();

    // 1000 keys: 250 leaves, then 50, 10 and 2 nodes under the root.
    let report = assert_tree_ok(&t.db, "big");
    assert_eq!(report.depth, 4);
    assert_eq!(report.nb_elems, 1000);
}
