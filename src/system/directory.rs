//! The tree directory: a system B+tree mapping `(name, revision)` to the
//! offset of that revision's tree header record. Every commit that
//! touches a user tree appends one entry; the reclaimer prunes entries
//! whose revisions no reader can see anymore.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::{
    btree::{
        info::BTreeInfo,
        page::BTreePage,
        tree::BTree,
        TreeKind,
    },
    config::DEFAULT_FANOUT,
    database::StoreInner,
    error::SnapError,
    io::{SnapReader, SnapWriter},
    paging::Pager,
    serializer::{I64Serializer, Serializer},
    types::{Revision, SnapResult},
    utils::HandyRwLock,
};

pub(crate) const DIRECTORY_TREE_NAME: &str = ".btree-directory";

/// Ordered by name first, then revision, so all revisions of one tree sit
/// next to each other and "latest revision at or below X" is a floor
/// lookup.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct DirectoryKey {
    pub name: String,
    pub revision: Revision,
}

pub(crate) struct DirectoryKeySerializer;

impl Serializer<DirectoryKey> for DirectoryKeySerializer {
    fn id(&self) -> &str {
        "name-rev"
    }

    fn serialize(&self, item: &DirectoryKey) -> Vec<u8> {
        let mut w = SnapWriter::new();
        w.put_str(&item.name);
        w.put_i64(item.revision);
        w.freeze().to_vec()
    }

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<DirectoryKey> {
        let name = reader.get_str()?;
        let revision = reader.get_i64()?;
        Ok(DirectoryKey { name, revision })
    }

    fn compare(&self, a: &DirectoryKey, b: &DirectoryKey) -> Ordering {
        a.cmp(b)
    }
}

pub(crate) fn directory_info() -> BTreeInfo {
    BTreeInfo {
        fanout: DEFAULT_FANOUT,
        name: DIRECTORY_TREE_NAME.to_string(),
        key_serializer: "name-rev".to_string(),
        value_serializer: "i64".to_string(),
        allow_duplicates: false,
    }
}

pub(crate) fn directory_tree(store: &Arc<StoreInner>) -> BTree<DirectoryKey, i64> {
    let info_offset = store.state.rl().directory_info;
    BTree::facade(
        Arc::clone(store),
        TreeKind::Directory,
        directory_info(),
        info_offset,
        Arc::new(DirectoryKeySerializer),
        Arc::new(I64Serializer),
    )
}

/// Full scan of a directory tree straight from the pager, used while the
/// store is still being opened.
pub(crate) fn scan_directory(
    pager: &Pager,
    root_offset: i64,
) -> SnapResult<Vec<(DirectoryKey, i64)>> {
    let mut out = Vec::new();
    scan_rec(pager, root_offset, &mut out)?;
    Ok(out)
}

fn scan_rec(pager: &Pager, offset: i64, out: &mut Vec<(DirectoryKey, i64)>) -> SnapResult {
    let max = pager.file_size() as usize;
    let bytes = pager.read_record(offset, max)?;
    let page: BTreePage<DirectoryKey, i64> =
        BTreePage::deserialize(bytes, &DirectoryKeySerializer, &I64Serializer)?;
    match page {
        BTreePage::Leaf(leaf) => {
            for (key, holder) in leaf.keys.into_iter().zip(leaf.values.into_iter()) {
                match holder {
                    crate::btree::value_holder::ValueHolder::Inline(vals) if !vals.is_empty() => {
                        out.push((key, vals[0]));
                    }
                    _ => {
                        return Err(SnapError::InvalidBTree(
                            "directory entry without a header offset".to_string(),
                        ))
                    }
                }
            }
            Ok(())
        }
        BTreePage::Node(node) => {
            for child in node.children {
                match child.first_offset() {
                    Some(first) => scan_rec(pager, first, out)?,
                    None => {
                        return Err(SnapError::InvalidBTree(
                            "directory node with an unserialized child".to_string(),
                        ))
                    }
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_key_order_name_then_revision() {
        let ser = DirectoryKeySerializer;
        let a = DirectoryKey {
            name: "alpha".into(),
            revision: 9,
        };
        let b = DirectoryKey {
            name: "beta".into(),
            revision: 1,
        };
        assert_eq!(ser.compare(&a, &b), Ordering::Less);

        let c = DirectoryKey {
            name: "alpha".into(),
            revision: 10,
        };
        assert_eq!(ser.compare(&a, &c), Ordering::Less);
    }

    #[test]
    fn test_round_trip() {
        let ser = DirectoryKeySerializer;
        let key = DirectoryKey {
            name: "users".into(),
            revision: 42,
        };
        let mut r = SnapReader::new(Bytes::from(ser.serialize(&key)));
        assert_eq!(ser.deserialize(&mut r).unwrap(), key);
    }
}
