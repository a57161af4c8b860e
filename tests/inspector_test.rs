mod common;

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use common::*;
use snapdb::{inspector, Database, StoreConfig};
use tempfile::TempDir;

#[test]
fn test_store_report_accounts_every_page() {
    let t = new_db();
    let ints = small_int_tree(&t.db);
    let tags = string_dup_tree(&t.db);
    for k in 1..=30 {
        ints.insert(k, k).unwrap();
    }
    tags.insert(1, "x".to_string()).unwrap();

    let report = inspector::check_store(&t.db).unwrap();
    assert_eq!(report.page_size, 512);
    assert_eq!(report.nb_trees, 4); // two system trees + two user trees
    assert_eq!(report.trees.len(), 2);
    assert_eq!(report.orphan_pages, 0);
    assert_eq!(report.file_size, t.db.file_size());

    let ints_report = report
        .trees
        .iter()
        .find(|tree| tree.name == "ints")
        .expect("ints tree listed");
    assert_eq!(ints_report.nb_elems, 30);
}

#[test]
fn test_dump_shows_the_tree_structure() {
    let t = new_db();
    let tree = small_int_tree(&t.db);
    for k in 1..=10 {
        tree.insert(k, k).unwrap();
    }

    let text = inspector::dump(&t.db).unwrap();
    assert!(text.contains("\"ints\""));
    assert!(text.contains("node"));
    assert!(text.contains("leaf"));
    assert!(text.contains("page size"));
}

#[test]
fn test_corrupted_file_is_detected() {
    setup();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corrupt.db");
    {
        let db = Database::open(&path, StoreConfig::default()).unwrap();
        let tree = small_int_tree(&db);
        for k in 1..=30 {
            tree.insert(k, k).unwrap();
        }
    }

    // Scribble over every data page, leaving the header intact.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    let len = file.metadata().unwrap().len();
    file.seek(SeekFrom::Start(512)).unwrap();
    let zeros = vec![0u8; (len - 512) as usize];
    file.write_all(&zeros).unwrap();
    drop(file);

    let result = Database::open(&path, StoreConfig::default());
    match result {
        Err(e) => assert!(e.is_corruption(), "unexpected error kind: {}", e),
        Ok(_) => panic!("opening a corrupted store must fail"),
    }
}

#[test]
fn test_free_pages_after_reclaim() {
    let t = new_db_with(eager_config());
    let tree = small_int_tree(&t.db);
    for round in 0..3 {
        for k in 1..=20 {
            tree.insert(k, k + round).unwrap();
        }
    }
    t.db.reclaim_now().unwrap();

    let report = inspector::check_store(&t.db).unwrap();
    assert!(report.free_pages > 0);
    assert_eq!(report.orphan_pages, 0);
}
