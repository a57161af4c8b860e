//! Phases 3 and 4: level planning and bottom-up fill.
//!
//! Level planning turns the exact key count into per-page entry counts.
//! Pages fill to the fanout; when the tail would fall below half
//! occupancy, the last two pages of the level share their entries so the
//! lower bound holds everywhere. The same rule shapes every node level
//! (on child counts) up to the single root.
//!
//! The fill then streams the merged tuples into the leftmost leaf
//! onwards. A completed page is serialized immediately and its leftmost
//! key cascades into the level above, so every page is written exactly
//! once at a fresh offset.

use std::mem;

use crate::{
    btree::{
        leaf::BTreeLeaf,
        node::BTreeNode,
        page::{BTreePage, PageRef},
        tree_header::TreeHeader,
        value_holder::ValueHolder,
        wal::TreeCtx,
    },
    error::SnapError,
    transaction::write::WriteTransaction,
    types::{SnapResult, NO_PAGE},
    utils::ceil_div,
};

use super::merge::MergedStream;

/// Per-page entry counts for one level holding `count` entries in pages
/// of capacity `cap` with lower bound `min`.
pub(crate) fn plan_level(count: usize, cap: usize, min: usize) -> Vec<usize> {
    if count <= cap {
        return vec![count];
    }
    let nb_pages = ceil_div(count, cap);
    let remainder = count % cap;
    let mut sizes = vec![cap; nb_pages];
    if remainder != 0 {
        // Balance the tail pair so the last page meets the lower bound.
        let tail = cap + remainder;
        sizes[nb_pages - 2] = tail - tail / 2;
        sizes[nb_pages - 1] = tail / 2;
    }
    debug_assert!(sizes[nb_pages - 1] >= min);
    sizes
}

/// Build a dense tree from an in-memory sequence; used for the nested
/// value trees. Returns the root record's offsets.
pub(crate) fn build_dense<K: Clone, V: Clone>(
    ctx: &TreeCtx<'_, K, V>,
    txn: &mut WriteTransaction,
    items: impl Iterator<Item = (K, Vec<V>)>,
    count: usize,
) -> SnapResult<(i64, i64)> {
    let mut items = items;
    build_dense_pull(ctx, txn, |_| Ok(items.next()), count)
}

/// Build a dense tree from the merge phase's output stream.
pub(crate) fn build_dense_stream<K: Clone, V: Clone>(
    ctx: &TreeCtx<'_, K, V>,
    txn: &mut WriteTransaction,
    stream: &mut MergedStream<K, V>,
    count: usize,
) -> SnapResult<(i64, i64)> {
    build_dense_pull(ctx, txn, |ctx| stream.next_group(ctx), count)
}

/// One node level under construction.
struct NodeLevel<K> {
    planned: Vec<usize>,
    next_page: usize,
    leftmost: Option<K>,
    keys: Vec<K>,
    children: Vec<(i64, i64)>,
}

impl<K> NodeLevel<K> {
    fn new(planned: Vec<usize>) -> Self {
        Self {
            planned,
            next_page: 0,
            leftmost: None,
            keys: Vec::new(),
            children: Vec::new(),
        }
    }
}

fn build_dense_pull<K: Clone, V: Clone>(
    ctx: &TreeCtx<'_, K, V>,
    txn: &mut WriteTransaction,
    mut next: impl FnMut(&TreeCtx<'_, K, V>) -> SnapResult<Option<(K, Vec<V>)>>,
    count: usize,
) -> SnapResult<(i64, i64)> {
    if count == 0 {
        let root = BTreePage::<K, V>::Leaf(BTreeLeaf::new_empty(
            txn.next_page_id(),
            txn.revision(),
        ));
        let payload = root.serialize(ctx.key_ser, ctx.val_ser)?;
        return txn.write_record(ctx.pager, &payload);
    }

    // Plan every level up front.
    let leaf_sizes = plan_level(count, ctx.fanout, ctx.half());
    let mut levels: Vec<NodeLevel<K>> = Vec::new();
    let mut width = leaf_sizes.len();
    while width > 1 {
        let plan = plan_level(width, ctx.fanout + 1, ctx.half() + 1);
        width = plan.len();
        levels.push(NodeLevel::new(plan));
    }

    let mut root: Option<(i64, i64)> = None;

    for planned in &leaf_sizes {
        let mut leaf = BTreeLeaf {
            id: txn.next_page_id(),
            revision: txn.revision(),
            keys: Vec::with_capacity(*planned),
            values: Vec::with_capacity(*planned),
        };
        for _ in 0..*planned {
            let (key, values) = next(ctx)?.ok_or_else(|| {
                SnapError::InvalidBTree("bulk input ended before the counted keys".to_string())
            })?;
            let holder = make_holder(ctx, txn, values)?;
            leaf.keys.push(key);
            leaf.values.push(holder);
        }
        let leftmost = leaf.keys[0].clone();
        let payload = BTreePage::Leaf(leaf).serialize(ctx.key_ser, ctx.val_ser)?;
        let offsets = txn.write_record(ctx.pager, &payload)?;
        push_up(ctx, txn, &mut levels, leftmost, offsets, &mut root)?;
    }

    if next(ctx)?.is_some() {
        return Err(SnapError::InvalidBTree(
            "bulk input longer than the counted keys".to_string(),
        ));
    }

    root.ok_or_else(|| SnapError::InvalidBTree("bulk build produced no root".to_string()))
}

/// Hand a completed page (its leftmost key and offsets) to the level
/// above; completed nodes cascade further up until the root is written.
fn push_up<K: Clone, V: Clone>(
    ctx: &TreeCtx<'_, K, V>,
    txn: &mut WriteTransaction,
    levels: &mut [NodeLevel<K>],
    leftmost: K,
    offsets: (i64, i64),
    root: &mut Option<(i64, i64)>,
) -> SnapResult {
    if levels.is_empty() {
        *root = Some(offsets);
        return Ok(());
    }

    let mut leftmost = leftmost;
    let mut child = offsets;
    let mut level = 0usize;

    loop {
        let lv = &mut levels[level];
        if lv.children.is_empty() {
            lv.leftmost = Some(leftmost.clone());
        } else {
            lv.keys.push(leftmost.clone());
        }
        lv.children.push(child);

        if lv.children.len() < lv.planned[lv.next_page] {
            return Ok(());
        }

        // Node complete: write it and pass it one level up.
        let node = BTreeNode {
            id: txn.next_page_id(),
            revision: txn.revision(),
            keys: mem::take(&mut lv.keys),
            children: lv
                .children
                .drain(..)
                .map(|(first, last)| PageRef::OnDisk { first, last })
                .collect(),
        };
        let node_leftmost = lv.leftmost.take().ok_or_else(|| {
            SnapError::InvalidBTree("bulk node completed without a first child".to_string())
        })?;
        lv.next_page += 1;

        let payload = BTreePage::<K, V>::Node(node).serialize(ctx.key_ser, ctx.val_ser)?;
        let offsets = txn.write_record(ctx.pager, &payload)?;

        if level + 1 >= levels.len() {
            *root = Some(offsets);
            return Ok(());
        }
        leftmost = node_leftmost;
        child = offsets;
        level += 1;
    }
}

/// Value holder for one key of a bulk-built leaf; a set past the inline
/// threshold becomes a dense nested value tree.
fn make_holder<K: Clone, V: Clone>(
    ctx: &TreeCtx<'_, K, V>,
    txn: &mut WriteTransaction,
    values: Vec<V>,
) -> SnapResult<ValueHolder<V>> {
    if values.is_empty() {
        return Err(SnapError::InvalidBTree(
            "bulk entry without values".to_string(),
        ));
    }
    if values.len() <= ctx.inline_threshold {
        return Ok(ValueHolder::Inline(values));
    }

    let sctx = ctx.sub_ctx();
    let count = values.len();
    let (first, _) = build_dense(&sctx, txn, values.into_iter().map(|v| (v, vec![()])), count)?;
    let header = TreeHeader {
        revision: txn.revision(),
        nb_elems: count as i64,
        root_offset: first,
        info_offset: NO_PAGE,
    };
    let (header_offset, _) = txn.write_record(ctx.pager, &header.serialize())?;
    Ok(ValueHolder::sub_tree(header_offset, count as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_exact_multiple() {
        assert_eq!(plan_level(8, 4, 2), vec![4, 4]);
    }

    #[test]
    fn test_plan_balances_tail_pair() {
        // Ten entries in fanout-4 pages: the tail pair shares 6.
        assert_eq!(plan_level(10, 4, 2), vec![4, 3, 3]);
        // A remainder of one would leave an illegal last page.
        assert_eq!(plan_level(9, 4, 2), vec![4, 3, 2]);
    }

    #[test]
    fn test_plan_single_page() {
        assert_eq!(plan_level(3, 4, 2), vec![3]);
        assert_eq!(plan_level(0, 4, 2), vec![0]);
    }

    #[test]
    fn test_plan_node_level() {
        // Three children fit one fanout-4 node (up to five pointers).
        assert_eq!(plan_level(3, 5, 3), vec![3]);
        assert_eq!(plan_level(6, 5, 3), vec![3, 3]);
    }
}
