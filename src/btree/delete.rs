//! Copy-on-write deletion.
//!
//! A delete that leaves a non-root page below half occupancy reports an
//! underflow to its parent, which rebalances with a sibling under the
//! same parent: borrow the sibling's nearest entry when it has entries to
//! spare, merge the two pages otherwise. Merges can cascade; a merge that
//! empties a two-child root collapses the root and shrinks the tree by
//! one level.
//!
//! Separators always equal the leftmost leaf key of their right subtree,
//! so removing a leaf's first key also rewrites the separator above it;
//! the `new_leftmost` field carries that key up until a parent consumes
//! it.

use log::debug;

use crate::{
    btree::{
        insert::{child_index, stamp_leaf, stamp_node},
        node::BTreeNode,
        page::{find_pos, BTreePage, PageRef},
        wal::{load_page, restore_page, Origin, TreeCtx, TreeWal},
    },
    error::SnapError,
    transaction::write::WriteTransaction,
    types::SnapResult,
};

pub(crate) enum DeleteTarget<V> {
    /// Remove the key and every value under it.
    WholeKey,
    /// Remove one value; the key goes too when its set empties.
    OneValue(V),
}

pub(crate) struct RemovedEntry<V> {
    pub values: Vec<V>,
    pub key_removed: bool,
}

pub(crate) enum DeleteResult<K, V> {
    NotPresent,
    Done {
        page: PageRef,
        new_leftmost: Option<K>,
        removed: RemovedEntry<V>,
    },
    Underflow {
        page: PageRef,
        new_leftmost: Option<K>,
        removed: RemovedEntry<V>,
    },
}

/// Delete starting from `wal.root`, collapsing the root as merges empty
/// it. `None` means the key (or value) was not there and nothing changed.
pub(crate) fn delete_in_wal<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    key: K,
    target: DeleteTarget<V>,
) -> SnapResult<Option<RemovedEntry<V>>> {
    let root = wal.root;
    match delete_rec(ctx, txn, wal, root, key, target, true)? {
        DeleteResult::NotPresent => Ok(None),
        DeleteResult::Done { page, removed, .. } | DeleteResult::Underflow { page, removed, .. } => {
            wal.root = page;
            collapse_root(wal)?;
            Ok(Some(removed))
        }
    }
}

/// Whole-key removal for the nested value trees: the value is the key.
pub(crate) fn delete_from_wal<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    key: K,
) -> SnapResult<bool> {
    Ok(delete_in_wal(ctx, txn, wal, key, DeleteTarget::WholeKey)?.is_some())
}

/// A root node left with a single child hands its place to that child.
fn collapse_root<K, V>(wal: &mut TreeWal<K, V>) -> SnapResult {
    loop {
        let id = match wal.root {
            PageRef::Wal { id } => id,
            PageRef::OnDisk { .. } => return Ok(()),
        };
        let lone_child = match wal.get(id) {
            Some(BTreePage::Node(node)) if node.keys.is_empty() => Some(node.children[0]),
            _ => None,
        };
        match lone_child {
            Some(child) => {
                wal.take(id)?;
                debug!("root collapsed, tree shrinks one level");
                wal.root = child;
            }
            None => return Ok(()),
        }
    }
}

pub(crate) fn delete_rec<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    page_ref: PageRef,
    key: K,
    target: DeleteTarget<V>,
    is_root: bool,
) -> SnapResult<DeleteResult<K, V>> {
    let (page, origin) = load_page(ctx, wal, page_ref)?;
    match page {
        BTreePage::Leaf(leaf) => {
            delete_from_leaf(ctx, txn, wal, leaf, origin, key, target, is_root)
        }
        BTreePage::Node(node) => {
            delete_from_node(ctx, txn, wal, node, origin, key, target, is_root)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn delete_from_leaf<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    mut leaf: crate::btree::leaf::BTreeLeaf<K, V>,
    origin: Origin,
    key: K,
    target: DeleteTarget<V>,
    is_root: bool,
) -> SnapResult<DeleteResult<K, V>> {
    let pos = match find_pos(&leaf.keys, &key, ctx.key_ser) {
        Ok(pos) => pos,
        Err(_) => {
            restore_page(wal, BTreePage::Leaf(leaf), origin);
            return Ok(DeleteResult::NotPresent);
        }
    };

    let removed = match target {
        DeleteTarget::WholeKey => {
            stamp_leaf(txn, wal, &mut leaf, &origin);
            leaf.keys.remove(pos);
            let mut holder = leaf.values.remove(pos);
            let values = holder.release(ctx, &mut wal.copied)?;
            RemovedEntry {
                values,
                key_removed: true,
            }
        }
        DeleteTarget::OneValue(value) => {
            if !leaf.values[pos].contains(ctx, &value)? {
                restore_page(wal, BTreePage::Leaf(leaf), origin);
                return Ok(DeleteResult::NotPresent);
            }
            stamp_leaf(txn, wal, &mut leaf, &origin);
            leaf.values[pos].remove_value(ctx, txn, &mut wal.copied, &value)?;
            let key_removed = leaf.values[pos].is_empty();
            if key_removed {
                leaf.keys.remove(pos);
                leaf.values.remove(pos);
            }
            RemovedEntry {
                values: vec![value],
                key_removed,
            }
        }
    };

    let new_leftmost = if removed.key_removed && pos == 0 {
        leaf.keys.first().cloned()
    } else {
        None
    };
    let underflow = !is_root && leaf.keys.len() < ctx.half();
    let page = wal.put(BTreePage::Leaf(leaf));

    if underflow {
        Ok(DeleteResult::Underflow {
            page,
            new_leftmost,
            removed,
        })
    } else {
        Ok(DeleteResult::Done {
            page,
            new_leftmost,
            removed,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn delete_from_node<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    mut node: BTreeNode<K>,
    origin: Origin,
    key: K,
    target: DeleteTarget<V>,
    is_root: bool,
) -> SnapResult<DeleteResult<K, V>> {
    let idx = child_index(find_pos(&node.keys, &key, ctx.key_ser));
    let child = node.children[idx];

    match delete_rec(ctx, txn, wal, child, key, target, false)? {
        DeleteResult::NotPresent => {
            restore_page(wal, BTreePage::Node(node), origin);
            Ok(DeleteResult::NotPresent)
        }
        DeleteResult::Done {
            page,
            new_leftmost,
            removed,
        } => {
            stamp_node(txn, wal, &mut node, &origin);
            node.children[idx] = page;
            let new_leftmost = apply_leftmost(&mut node, idx, new_leftmost);
            Ok(DeleteResult::Done {
                page: wal.put(BTreePage::Node(node)),
                new_leftmost,
                removed,
            })
        }
        DeleteResult::Underflow {
            page,
            new_leftmost,
            removed,
        } => {
            stamp_node(txn, wal, &mut node, &origin);
            node.children[idx] = page;

            let kind = rebalance(ctx, txn, wal, &mut node, idx)?;
            let new_leftmost = match kind {
                RebalanceKind::BorrowedFromLeft | RebalanceKind::MergedWithLeft => None,
                RebalanceKind::BorrowedFromRight => apply_leftmost(&mut node, idx, new_leftmost),
                RebalanceKind::MergedWithRight => new_leftmost,
            };

            let underflow = !is_root && node.keys.len() < ctx.half();
            let page = wal.put(BTreePage::Node(node));
            if underflow {
                Ok(DeleteResult::Underflow {
                    page,
                    new_leftmost,
                    removed,
                })
            } else {
                Ok(DeleteResult::Done {
                    page,
                    new_leftmost,
                    removed,
                })
            }
        }
    }
}

/// Rewrite the separator left of `idx` when the child's subtree got a new
/// leftmost key; at `idx == 0` the ancestor owns that separator instead.
fn apply_leftmost<K>(node: &mut BTreeNode<K>, idx: usize, leftmost: Option<K>) -> Option<K> {
    match leftmost {
        None => None,
        Some(k) => {
            if idx > 0 {
                node.keys[idx - 1] = k;
                None
            } else {
                Some(k)
            }
        }
    }
}

enum RebalanceKind {
    BorrowedFromLeft,
    BorrowedFromRight,
    MergedWithLeft,
    MergedWithRight,
}

/// Fix the underfull child at `idx`. The left sibling is preferred when
/// both exist; borrowing moves the sibling's nearest entry, merging folds
/// the pair into the left-hand page.
fn rebalance<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    parent: &mut BTreeNode<K>,
    idx: usize,
) -> SnapResult<RebalanceKind> {
    let use_left = idx > 0;
    let sib_idx = if use_left { idx - 1 } else { idx + 1 };
    if sib_idx >= parent.children.len() {
        return Err(SnapError::InvalidBTree(
            "underfull page has no sibling to rebalance with".to_string(),
        ));
    }

    let (mut sibling, sib_origin) = load_page(ctx, wal, parent.children[sib_idx])?;
    // The sibling is rewritten by a borrow and absorbed by a merge, so it
    // is superseded either way.
    if let Origin::Disk { first, .. } = sib_origin {
        wal.copied.push(first);
        sibling.set_stamp(txn.next_page_id(), txn.revision());
    }
    let (child, _) = load_page(ctx, wal, parent.children[idx])?;

    match (child, sibling) {
        (BTreePage::Leaf(mut child), BTreePage::Leaf(mut sib)) => {
            if sib.keys.len() > ctx.half() {
                if use_left {
                    let k = sib.keys.pop().expect("left sibling has entries");
                    let v = sib.values.pop().expect("left sibling has entries");
                    child.keys.insert(0, k.clone());
                    child.values.insert(0, v);
                    parent.keys[idx - 1] = k;
                    parent.children[sib_idx] = wal.put(BTreePage::Leaf(sib));
                    parent.children[idx] = wal.put(BTreePage::Leaf(child));
                    debug!("leaf borrowed rightmost entry of its left sibling");
                    Ok(RebalanceKind::BorrowedFromLeft)
                } else {
                    let k = sib.keys.remove(0);
                    let v = sib.values.remove(0);
                    child.keys.push(k);
                    child.values.push(v);
                    parent.keys[idx] = sib.keys[0].clone();
                    parent.children[sib_idx] = wal.put(BTreePage::Leaf(sib));
                    parent.children[idx] = wal.put(BTreePage::Leaf(child));
                    debug!("leaf borrowed leftmost entry of its right sibling");
                    Ok(RebalanceKind::BorrowedFromRight)
                }
            } else {
                let (li, mut left, right) = if use_left {
                    (sib_idx, sib, child)
                } else {
                    (idx, child, sib)
                };
                left.keys.extend(right.keys);
                left.values.extend(right.values);
                parent.keys.remove(li);
                parent.children.remove(li + 1);
                parent.children[li] = wal.put(BTreePage::Leaf(left));
                debug!("leaf pair merged");
                Ok(if use_left {
                    RebalanceKind::MergedWithLeft
                } else {
                    RebalanceKind::MergedWithRight
                })
            }
        }
        (BTreePage::Node(mut child), BTreePage::Node(mut sib)) => {
            if sib.keys.len() > ctx.half() {
                if use_left {
                    // Rotate through the parent separator.
                    child.keys.insert(0, parent.keys[idx - 1].clone());
                    let moved = sib.children.pop().expect("left sibling has children");
                    child.children.insert(0, moved);
                    parent.keys[idx - 1] = sib.keys.pop().expect("left sibling has keys");
                    parent.children[sib_idx] = wal.put(BTreePage::Node(sib));
                    parent.children[idx] = wal.put(BTreePage::Node(child));
                    Ok(RebalanceKind::BorrowedFromLeft)
                } else {
                    child.keys.push(parent.keys[idx].clone());
                    child.children.push(sib.children.remove(0));
                    parent.keys[idx] = sib.keys.remove(0);
                    parent.children[sib_idx] = wal.put(BTreePage::Node(sib));
                    parent.children[idx] = wal.put(BTreePage::Node(child));
                    Ok(RebalanceKind::BorrowedFromRight)
                }
            } else {
                // Pull the separator down between the two halves.
                let (li, mut left, right) = if use_left {
                    (sib_idx, sib, child)
                } else {
                    (idx, child, sib)
                };
                left.keys.push(parent.keys[li].clone());
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                parent.keys.remove(li);
                parent.children.remove(li + 1);
                parent.children[li] = wal.put(BTreePage::Node(left));
                debug!("node pair merged");
                Ok(if use_left {
                    RebalanceKind::MergedWithLeft
                } else {
                    RebalanceKind::MergedWithRight
                })
            }
        }
        _ => Err(SnapError::InvalidBTree(
            "sibling pages of different kinds".to_string(),
        )),
    }
}
