//! Per-key value storage.
//!
//! A key's values live inline in its leaf entry while the set is small.
//! Past the configured threshold they move into a nested value tree: a
//! B+tree of this same engine whose keys are the values, rooted at a tree
//! header record referenced from the leaf entry.

use std::mem;

use crate::{
    btree::{
        delete::delete_from_wal,
        insert::insert_into_wal,
        page::{find_pos, BTreePage, PageRef},
        tree_header::{read_tree_header, TreeHeader},
        wal::{TreeCtx, TreeWal},
    },
    bulk::build_dense,
    error::SnapError,
    transaction::write::WriteTransaction,
    types::{SnapResult, NO_PAGE},
};

pub(crate) enum ValueHolder<V> {
    /// Sorted by the value serializer's order.
    Inline(Vec<V>),
    SubTree(SubTreeHolder<V>),
}

pub(crate) struct SubTreeHolder<V> {
    /// Offset of the value tree's header record; `NO_PAGE` until the
    /// dirty pages below are flushed.
    pub header_offset: i64,
    pub count: i64,
    /// Present while the current write transaction has modified the value
    /// tree; drained when the owning leaf is serialized.
    pub dirty: Option<Box<TreeWal<V, ()>>>,
}

impl<V: Clone> Clone for ValueHolder<V> {
    fn clone(&self) -> Self {
        match self {
            ValueHolder::Inline(vals) => ValueHolder::Inline(vals.clone()),
            ValueHolder::SubTree(sub) => {
                debug_assert!(sub.dirty.is_none(), "cloning a dirty value tree holder");
                ValueHolder::SubTree(SubTreeHolder {
                    header_offset: sub.header_offset,
                    count: sub.count,
                    dirty: None,
                })
            }
        }
    }
}

impl<V: Clone> ValueHolder<V> {
    pub fn single(value: V) -> Self {
        ValueHolder::Inline(vec![value])
    }

    pub fn sub_tree(header_offset: i64, count: i64) -> Self {
        ValueHolder::SubTree(SubTreeHolder {
            header_offset,
            count,
            dirty: None,
        })
    }

    pub fn nb_values(&self) -> i64 {
        match self {
            ValueHolder::Inline(vals) => vals.len() as i64,
            ValueHolder::SubTree(sub) => sub.count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nb_values() == 0
    }

    pub fn contains<K>(&self, ctx: &TreeCtx<K, V>, value: &V) -> SnapResult<bool> {
        match self {
            ValueHolder::Inline(vals) => Ok(find_pos(vals, value, ctx.val_ser).is_ok()),
            ValueHolder::SubTree(sub) => {
                let sctx = ctx.sub_ctx();
                let (root, wal) = sub.root_and_wal(ctx)?;
                sub_contains(&sctx, wal, root, value)
            }
        }
    }

    pub fn first_value<K>(&self, ctx: &TreeCtx<K, V>) -> SnapResult<Option<V>> {
        match self {
            ValueHolder::Inline(vals) => Ok(vals.first().cloned()),
            ValueHolder::SubTree(sub) => {
                let sctx = ctx.sub_ctx();
                let (root, wal) = sub.root_and_wal(ctx)?;
                sub_first(&sctx, wal, root)
            }
        }
    }

    /// All values in serializer order.
    pub fn values<K>(&self, ctx: &TreeCtx<K, V>) -> SnapResult<Vec<V>> {
        match self {
            ValueHolder::Inline(vals) => Ok(vals.clone()),
            ValueHolder::SubTree(sub) => {
                let sctx = ctx.sub_ctx();
                let (root, wal) = sub.root_and_wal(ctx)?;
                let mut out = Vec::with_capacity(sub.count as usize);
                sub_collect(&sctx, wal, root, &mut out)?;
                Ok(out)
            }
        }
    }

    /// Add a value the caller has verified to be absent. Crossing the
    /// inline threshold converts the set into a value tree.
    pub fn add_value<K: Clone>(
        &mut self,
        ctx: &TreeCtx<K, V>,
        txn: &mut WriteTransaction,
        value: V,
    ) -> SnapResult {
        // Decide the conversion outside the borrow of the inline vector.
        let overflow: Option<Vec<V>> = match self {
            ValueHolder::Inline(vals) => {
                let pos = match find_pos(vals, &value, ctx.val_ser) {
                    Ok(_) => {
                        return Err(SnapError::InvalidBTree(
                            "value already present in holder".to_string(),
                        ))
                    }
                    Err(pos) => pos,
                };
                vals.insert(pos, value);
                if vals.len() > ctx.inline_threshold {
                    Some(mem::take(vals))
                } else {
                    None
                }
            }
            ValueHolder::SubTree(sub) => {
                let sctx = ctx.sub_ctx();
                let mut wal = sub.take_wal(ctx)?;
                insert_into_wal(&sctx, txn, &mut wal, value, ())?;
                sub.count += 1;
                sub.dirty = Some(wal);
                None
            }
        };

        if let Some(vals) = overflow {
            let sctx = ctx.sub_ctx();
            let count = vals.len();
            let (first, _last) =
                build_dense(&sctx, txn, vals.into_iter().map(|v| (v, vec![()])), count)?;
            let header = TreeHeader {
                revision: txn.revision(),
                nb_elems: count as i64,
                root_offset: first,
                info_offset: NO_PAGE,
            };
            let (header_offset, _) = txn.write_record(ctx.pager, &header.serialize())?;
            *self = ValueHolder::sub_tree(header_offset, count as i64);
        }
        Ok(())
    }

    /// Swap the single value of a no-duplicates entry, returning the old
    /// one.
    pub fn replace_value(&mut self, value: V) -> SnapResult<V> {
        match self {
            ValueHolder::Inline(vals) if vals.len() == 1 => Ok(mem::replace(&mut vals[0], value)),
            _ => Err(SnapError::InvalidBTree(
                "replace on a multi-value holder".to_string(),
            )),
        }
    }

    /// Remove a value the caller has verified to be present. A value tree
    /// that shrinks enough folds back into an inline set; the pages it
    /// occupied are appended to `copied`.
    pub fn remove_value<K: Clone>(
        &mut self,
        ctx: &TreeCtx<K, V>,
        txn: &mut WriteTransaction,
        copied: &mut Vec<i64>,
        value: &V,
    ) -> SnapResult {
        let shrink = match self {
            ValueHolder::Inline(vals) => {
                match find_pos(vals, value, ctx.val_ser) {
                    Ok(pos) => {
                        vals.remove(pos);
                    }
                    Err(_) => {
                        return Err(SnapError::InvalidBTree(
                            "value missing from holder".to_string(),
                        ))
                    }
                }
                false
            }
            ValueHolder::SubTree(sub) => {
                let sctx = ctx.sub_ctx();
                let mut wal = sub.take_wal(ctx)?;
                if !delete_from_wal(&sctx, txn, &mut wal, value.clone())? {
                    return Err(SnapError::InvalidBTree(
                        "value missing from value tree".to_string(),
                    ));
                }
                sub.count -= 1;
                sub.dirty = Some(wal);
                sub.count <= (ctx.inline_threshold / 2).max(1) as i64
            }
        };

        if shrink {
            let values = self.release(ctx, copied)?;
            *self = ValueHolder::Inline(values);
        }
        Ok(())
    }

    /// Tear the holder down: return its values and append every on-disk
    /// record it occupied (pages and tree header) to `copied`.
    pub fn release<K>(&mut self, ctx: &TreeCtx<K, V>, copied: &mut Vec<i64>) -> SnapResult<Vec<V>> {
        match self {
            ValueHolder::Inline(vals) => Ok(mem::take(vals)),
            ValueHolder::SubTree(sub) => {
                let sctx = ctx.sub_ctx();
                let wal = sub.dirty.take();
                let root = match &wal {
                    Some(w) => w.root,
                    None => sub.disk_root(ctx)?,
                };

                let mut values = Vec::with_capacity(sub.count as usize);
                sub_collect(&sctx, wal.as_deref(), root, &mut values)?;
                sub_offsets(&sctx, wal.as_deref(), root, copied)?;
                if let Some(w) = wal {
                    copied.extend(w.copied);
                }
                if sub.header_offset != NO_PAGE {
                    copied.push(sub.header_offset);
                }
                Ok(values)
            }
        }
    }
}

impl<V: Clone> SubTreeHolder<V> {
    fn disk_root<K>(&self, ctx: &TreeCtx<K, V>) -> SnapResult<PageRef> {
        if self.header_offset == NO_PAGE {
            return Err(SnapError::InvalidBTree(
                "value tree holder without a header".to_string(),
            ));
        }
        let header = read_tree_header(ctx.pager, self.header_offset)?;
        Ok(PageRef::OnDisk {
            first: header.root_offset,
            last: NO_PAGE,
        })
    }

    fn root_and_wal<'s, K>(
        &'s self,
        ctx: &TreeCtx<K, V>,
    ) -> SnapResult<(PageRef, Option<&'s TreeWal<V, ()>>)> {
        match &self.dirty {
            Some(wal) => Ok((wal.root, Some(wal.as_ref()))),
            None => Ok((self.disk_root(ctx)?, None)),
        }
    }

    /// The wal of the current transaction, creating one rooted at the
    /// committed tree if this is the first touch.
    fn take_wal<K>(&mut self, ctx: &TreeCtx<K, V>) -> SnapResult<Box<TreeWal<V, ()>>> {
        match self.dirty.take() {
            Some(wal) => Ok(wal),
            None => Ok(Box::new(TreeWal::new(self.disk_root(ctx)?))),
        }
    }
}

// ------------------------------------------------- value tree traversals

fn sub_page<'a, V: Clone>(
    sctx: &TreeCtx<V, ()>,
    wal: Option<&'a TreeWal<V, ()>>,
    r: PageRef,
    owned: &'a mut Option<BTreePage<V, ()>>,
) -> SnapResult<&'a BTreePage<V, ()>> {
    match r {
        PageRef::OnDisk { first, .. } => {
            *owned = Some(sctx.read_page(first)?);
            Ok(owned.as_ref().expect("just stored"))
        }
        PageRef::Wal { id } => wal.and_then(|w| w.get(id)).ok_or_else(|| {
            SnapError::InvalidBTree(format!("value tree page {} not in the page set", id))
        }),
    }
}

fn sub_contains<V: Clone>(
    sctx: &TreeCtx<V, ()>,
    wal: Option<&TreeWal<V, ()>>,
    r: PageRef,
    value: &V,
) -> SnapResult<bool> {
    let mut owned = None;
    match sub_page(sctx, wal, r, &mut owned)? {
        BTreePage::Leaf(leaf) => Ok(find_pos(&leaf.keys, value, sctx.key_ser).is_ok()),
        BTreePage::Node(node) => {
            let idx = match find_pos(&node.keys, value, sctx.key_ser) {
                Ok(pos) => pos + 1,
                Err(pos) => pos,
            };
            let child = node.children[idx];
            sub_contains(sctx, wal, child, value)
        }
    }
}

fn sub_first<V: Clone>(
    sctx: &TreeCtx<V, ()>,
    wal: Option<&TreeWal<V, ()>>,
    r: PageRef,
) -> SnapResult<Option<V>> {
    let mut owned = None;
    match sub_page(sctx, wal, r, &mut owned)? {
        BTreePage::Leaf(leaf) => Ok(leaf.keys.first().cloned()),
        BTreePage::Node(node) => {
            let child = node.children[0];
            sub_first(sctx, wal, child)
        }
    }
}

fn sub_collect<V: Clone>(
    sctx: &TreeCtx<V, ()>,
    wal: Option<&TreeWal<V, ()>>,
    r: PageRef,
    out: &mut Vec<V>,
) -> SnapResult {
    let mut owned = None;
    match sub_page(sctx, wal, r, &mut owned)? {
        BTreePage::Leaf(leaf) => {
            out.extend(leaf.keys.iter().cloned());
            Ok(())
        }
        BTreePage::Node(node) => {
            let children = node.children.clone();
            for child in children {
                sub_collect(sctx, wal, child, out)?;
            }
            Ok(())
        }
    }
}

/// First offsets of every on-disk record reachable from `r`.
fn sub_offsets<V: Clone>(
    sctx: &TreeCtx<V, ()>,
    wal: Option<&TreeWal<V, ()>>,
    r: PageRef,
    out: &mut Vec<i64>,
) -> SnapResult {
    if let PageRef::OnDisk { first, .. } = r {
        out.push(first);
    }
    let mut owned = None;
    match sub_page(sctx, wal, r, &mut owned)? {
        BTreePage::Leaf(_) => Ok(()),
        BTreePage::Node(node) => {
            let children = node.children.clone();
            for child in children {
                sub_offsets(sctx, wal, child, out)?;
            }
            Ok(())
        }
    }
}
