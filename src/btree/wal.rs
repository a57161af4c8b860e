//! The write-ahead page set of one tree inside one write transaction.
//!
//! Copy-on-write never mutates a committed page: the first modifying
//! touch deserializes it, restamps it with the transaction's revision and
//! a fresh page id, and records the old offset as superseded. All new
//! pages live in a [`TreeWal`] keyed by page id until commit serializes
//! them bottom-up.

use std::collections::HashMap;

use crate::{
    btree::{
        page::{BTreePage, PageRef},
        tree_header::TreeHeader,
        value_holder::ValueHolder,
    },
    error::SnapError,
    paging::Pager,
    serializer::{Serializer, UnitSerializer},
    transaction::write::WriteTransaction,
    types::{SnapResult, NO_PAGE},
};

pub(crate) static UNIT_SERIALIZER: UnitSerializer = UnitSerializer;

/// Everything a page operation needs to know about its tree.
pub(crate) struct TreeCtx<'a, K, V> {
    pub pager: &'a Pager,
    pub key_ser: &'a dyn Serializer<K>,
    pub val_ser: &'a dyn Serializer<V>,
    pub fanout: usize,
    pub allow_duplicates: bool,
    pub inline_threshold: usize,
}

impl<'a, K, V> TreeCtx<'a, K, V> {
    /// Minimum entry count of a non-root page.
    pub fn half(&self) -> usize {
        self.fanout / 2
    }

    /// Context of the nested value trees hanging off this tree's leaves:
    /// the values become the keys and the value side is empty.
    pub fn sub_ctx(&self) -> TreeCtx<'a, V, ()> {
        TreeCtx {
            pager: self.pager,
            key_ser: self.val_ser,
            val_ser: &UNIT_SERIALIZER,
            fanout: self.fanout,
            allow_duplicates: false,
            inline_threshold: self.inline_threshold,
        }
    }

    pub fn read_page(&self, offset: i64) -> SnapResult<BTreePage<K, V>>
    where
        V: Clone,
    {
        let max = self.pager.file_size() as usize;
        let bytes = self.pager.read_record(offset, max)?;
        BTreePage::deserialize(bytes, self.key_ser, self.val_ser)
    }
}

pub(crate) struct TreeWal<K, V> {
    pages: HashMap<i64, BTreePage<K, V>>,
    pub root: PageRef,
    /// First offsets of superseded on-disk records.
    pub copied: Vec<i64>,
}

impl<K, V> TreeWal<K, V> {
    pub fn new(root: PageRef) -> Self {
        Self {
            pages: HashMap::new(),
            root,
            copied: Vec::new(),
        }
    }

    pub fn put(&mut self, page: BTreePage<K, V>) -> PageRef {
        let id = page.id();
        self.pages.insert(id, page);
        PageRef::Wal { id }
    }

    pub fn take(&mut self, id: i64) -> SnapResult<BTreePage<K, V>> {
        self.pages.remove(&id).ok_or_else(|| {
            SnapError::InvalidBTree(format!("page {} missing from the transaction page set", id))
        })
    }

    pub fn get(&self, id: i64) -> Option<&BTreePage<K, V>> {
        self.pages.get(&id)
    }
}

/// Where a loaded page came from; decides the copy-on-write bookkeeping.
pub(crate) enum Origin {
    Disk { first: i64, last: i64 },
    Wal,
}

pub(crate) fn load_page<K, V: Clone>(
    ctx: &TreeCtx<K, V>,
    wal: &mut TreeWal<K, V>,
    r: PageRef,
) -> SnapResult<(BTreePage<K, V>, Origin)> {
    match r {
        PageRef::OnDisk { first, last } => {
            Ok((ctx.read_page(first)?, Origin::Disk { first, last }))
        }
        PageRef::Wal { id } => Ok((wal.take(id)?, Origin::Wal)),
    }
}

/// Put a page back untouched (the operation turned out to be a no-op).
pub(crate) fn restore_page<K, V>(
    wal: &mut TreeWal<K, V>,
    page: BTreePage<K, V>,
    origin: Origin,
) -> PageRef {
    match origin {
        Origin::Disk { first, last } => PageRef::OnDisk { first, last },
        Origin::Wal => wal.put(page),
    }
}

/// Serialize every wal page reachable from `r`, bottom-up, and return the
/// record offsets of `r` itself. Pages already on disk are left alone.
pub(crate) fn write_pages<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    r: &PageRef,
) -> SnapResult<(i64, i64)> {
    match *r {
        PageRef::OnDisk { first, last } => Ok((first, last)),
        PageRef::Wal { id } => {
            let mut page = wal.take(id)?;
            match &mut page {
                BTreePage::Node(node) => {
                    for i in 0..node.children.len() {
                        let child = node.children[i];
                        if child.is_wal() {
                            let (first, last) = write_pages(ctx, txn, wal, &child)?;
                            node.children[i] = PageRef::OnDisk { first, last };
                        }
                    }
                }
                BTreePage::Leaf(leaf) => {
                    for holder in leaf.values.iter_mut() {
                        flush_value_tree(ctx, txn, &mut wal.copied, holder)?;
                    }
                }
            }
            let payload = page.serialize(ctx.key_ser, ctx.val_ser)?;
            txn.write_record(ctx.pager, &payload)
        }
    }
}

/// Write out the dirty pages of one nested value tree and point its
/// holder at the freshly written tree header.
fn flush_value_tree<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    copied_out: &mut Vec<i64>,
    holder: &mut ValueHolder<V>,
) -> SnapResult {
    let sub = match holder {
        ValueHolder::SubTree(sub) => sub,
        ValueHolder::Inline(_) => return Ok(()),
    };
    let mut sub_wal = match sub.dirty.take() {
        Some(wal) => wal,
        None => return Ok(()),
    };

    let sctx = ctx.sub_ctx();
    let root = sub_wal.root;
    let (first, _last) = write_pages(&sctx, txn, &mut sub_wal, &root)?;
    copied_out.append(&mut sub_wal.copied);

    if sub.header_offset != NO_PAGE {
        copied_out.push(sub.header_offset);
    }
    let header = TreeHeader {
        revision: txn.revision(),
        nb_elems: sub.count,
        root_offset: first,
        info_offset: NO_PAGE,
    };
    let (header_offset, _) = txn.write_record(ctx.pager, &header.serialize())?;
    sub.header_offset = header_offset;
    Ok(())
}
