//! The copied-pages tree: a system B+tree mapping `(revision, name)` to
//! the record offsets that commit made obsolete. The reclaimer walks it
//! from the oldest revision forward and returns everything below the
//! oldest live reader to the free list.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::{
    btree::{info::BTreeInfo, tree::BTree, TreeKind},
    config::DEFAULT_FANOUT,
    database::StoreInner,
    io::{SnapReader, SnapWriter},
    serializer::Serializer,
    types::{Revision, SnapResult},
    utils::HandyRwLock,
};

pub(crate) const COPIED_PAGES_TREE_NAME: &str = ".copied-pages";

/// Ordered by revision first so the reclaimer's walk is a prefix scan.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CopiedKey {
    pub revision: Revision,
    pub name: String,
}

pub(crate) struct CopiedKeySerializer;

impl Serializer<CopiedKey> for CopiedKeySerializer {
    fn id(&self) -> &str {
        "rev-name"
    }

    fn serialize(&self, item: &CopiedKey) -> Vec<u8> {
        let mut w = SnapWriter::new();
        w.put_i64(item.revision);
        w.put_str(&item.name);
        w.freeze().to_vec()
    }

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<CopiedKey> {
        let revision = reader.get_i64()?;
        let name = reader.get_str()?;
        Ok(CopiedKey { revision, name })
    }

    fn compare(&self, a: &CopiedKey, b: &CopiedKey) -> Ordering {
        a.cmp(b)
    }
}

/// Offset lists are stored as a counted sequence of i64s.
pub(crate) struct OffsetListSerializer;

impl Serializer<Vec<i64>> for OffsetListSerializer {
    fn id(&self) -> &str {
        "offset-list"
    }

    fn serialize(&self, item: &Vec<i64>) -> Vec<u8> {
        let mut w = SnapWriter::with_capacity(4 + item.len() * 8);
        w.put_i32(item.len() as i32);
        for off in item {
            w.put_i64(*off);
        }
        w.freeze().to_vec()
    }

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<Vec<i64>> {
        let nb = reader.get_i32()?;
        let mut out = Vec::with_capacity(nb.max(0) as usize);
        for _ in 0..nb {
            out.push(reader.get_i64()?);
        }
        Ok(out)
    }

    fn compare(&self, a: &Vec<i64>, b: &Vec<i64>) -> Ordering {
        a.cmp(b)
    }
}

pub(crate) fn copied_pages_info() -> BTreeInfo {
    BTreeInfo {
        fanout: DEFAULT_FANOUT,
        name: COPIED_PAGES_TREE_NAME.to_string(),
        key_serializer: "rev-name".to_string(),
        value_serializer: "offset-list".to_string(),
        allow_duplicates: false,
    }
}

pub(crate) fn copied_pages_tree(store: &Arc<StoreInner>) -> BTree<CopiedKey, Vec<i64>> {
    let info_offset = store.state.rl().copied_info;
    BTree::facade(
        Arc::clone(store),
        TreeKind::CopiedPages,
        copied_pages_info(),
        info_offset,
        Arc::new(CopiedKeySerializer),
        Arc::new(OffsetListSerializer),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_key_order_revision_then_name() {
        let ser = CopiedKeySerializer;
        let a = CopiedKey {
            revision: 3,
            name: "zzz".into(),
        };
        let b = CopiedKey {
            revision: 4,
            name: "aaa".into(),
        };
        assert_eq!(ser.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_offset_list_round_trip() {
        let ser = OffsetListSerializer;
        let offsets = vec![512i64, 1024, 4096];
        let mut r = SnapReader::new(Bytes::from(ser.serialize(&offsets)));
        assert_eq!(ser.deserialize(&mut r).unwrap(), offsets);
    }
}
