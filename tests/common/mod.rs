#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use snapdb::{init_log, BTree, Database, I64Serializer, StoreConfig, StringSerializer};
use tempfile::TempDir;

/// Scratch store living in a temp directory; the directory outlives the
/// database handle.
pub struct TestDb {
    pub db: Database,
    _dir: TempDir,
}

pub fn setup() {
    init_log();
}

pub fn new_db() -> TestDb {
    new_db_with(StoreConfig::default())
}

pub fn new_db_with(config: StoreConfig) -> TestDb {
    setup();
    let dir = TempDir::new().expect("temp dir");
    let db = Database::open(dir.path().join("test.db"), config).expect("open store");
    TestDb { db, _dir: dir }
}

/// Quick-reap configuration with the automatic reclaimer disabled, so
/// the mvcc tests control reclamation themselves.
pub fn eager_config() -> StoreConfig {
    StoreConfig::default()
        .with_read_timeout(Duration::from_millis(150))
        .with_reaper_period(Duration::from_millis(20))
        .with_reclaim_commit_threshold(u32::MAX)
}

/// An i64 -> i64 tree with a small fanout so splits and merges trigger
/// with a handful of keys.
pub fn small_int_tree(db: &Database) -> BTree<i64, i64> {
    db.manage(
        "ints",
        Arc::new(I64Serializer),
        Arc::new(I64Serializer),
        4,
        false,
    )
    .expect("manage tree")
}

pub fn string_dup_tree(db: &Database) -> BTree<i64, String> {
    db.manage(
        "tags",
        Arc::new(I64Serializer),
        Arc::new(StringSerializer),
        4,
        true,
    )
    .expect("manage tree")
}

/// Drain a tuple cursor into a vector, failing the test on any error.
pub fn collect_tuples<K, V>(cursor: snapdb::TupleCursor<K, V>) -> Vec<(K, V)>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cursor.map(|r| r.expect("cursor step")).collect()
}

pub fn assert_tree_ok(db: &Database, name: &str) -> snapdb::inspector::TreeReport {
    snapdb::inspector::check_tree(db, name).expect("tree check")
}
