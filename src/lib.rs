//! An embedded, single-file, multi-version B+tree storage engine.
//!
//! One backing file holds any number of named ordered maps. Updates are
//! copy-on-write: a commit writes fresh pages, appends a directory entry
//! and atomically rewrites the header page, so readers keep navigating
//! their pinned revision while a single writer publishes the next one.
//! Superseded pages are returned to a free list once no reader can still
//! see them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use snapdb::{Database, I64Serializer, StringSerializer, StoreConfig};
//!
//! let db = Database::open("example.db", StoreConfig::default())?;
//! let tree = db.manage(
//!     "users",
//!     Arc::new(I64Serializer),
//!     Arc::new(StringSerializer),
//!     16,
//!     false,
//! )?;
//! tree.insert(1, "alice".to_string())?;
//! assert_eq!(tree.get(&1)?, Some("alice".to_string()));
//! # Ok::<(), snapdb::SnapError>(())
//! ```

mod btree;
mod bulk;
mod config;
mod database;
mod error;
pub mod inspector;
mod io;
mod log;
mod paging;
mod serializer;
mod system;
mod transaction;
mod types;
mod utils;

pub use btree::{BTree, BTreeInfo, InsertOutcome, KeyCursor, TupleCursor};
pub use config::{StoreConfig, DEFAULT_FANOUT, DEFAULT_PAGE_SIZE};
pub use database::Database;
pub use error::SnapError;
pub use log::init_log;
pub use paging::{FileHeader, PageIO, Pager};
pub use serializer::{
    BytesSerializer, I64Serializer, RawKeyComparator, Serializer, StringSerializer, U64Serializer,
    UnitSerializer,
};
pub use transaction::{ReadTransaction, WriteTransaction};
pub use types::{Revision, SnapResult, NO_PAGE};

#[cfg(feature = "testing-api")]
pub use database::FailPoint;
