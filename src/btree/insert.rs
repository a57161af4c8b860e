//! Copy-on-write insertion.
//!
//! The descent loads each page on the path, copies it into the write
//! transaction's page set on first touch, and hands structural changes
//! back to the parent as a tagged result: either the child was rewritten
//! in place, or it split and the parent has a pivot to absorb.

use log::debug;

use crate::{
    btree::{
        leaf::BTreeLeaf,
        node::BTreeNode,
        page::{find_pos, BTreePage, PageRef},
        value_holder::ValueHolder,
        wal::{load_page, restore_page, Origin, TreeCtx, TreeWal},
    },
    transaction::write::WriteTransaction,
    types::SnapResult,
};

/// What an insertion did at the tree level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome<V> {
    /// A new key went in.
    Inserted,
    /// A new value joined an existing key's set (duplicates allowed).
    Added,
    /// The key's single value was swapped (duplicates disabled); carries
    /// the old value.
    Replaced(V),
    /// The exact key/value pair was already there; the tree is untouched.
    Exists,
}

impl<V> InsertOutcome<V> {
    pub(crate) fn key_delta(&self) -> i64 {
        matches!(self, InsertOutcome::Inserted) as i64
    }
}

pub(crate) enum InsertResult<K, V> {
    Done {
        page: PageRef,
        outcome: InsertOutcome<V>,
    },
    Split {
        pivot: K,
        left: PageRef,
        right: PageRef,
        outcome: InsertOutcome<V>,
    },
}

/// Child slot for a routing lookup: an exact separator hit goes right
/// (separators equal the leftmost key of their right subtree).
pub(crate) fn child_index(found: Result<usize, usize>) -> usize {
    match found {
        Ok(pos) => pos + 1,
        Err(pos) => pos,
    }
}

pub(crate) fn stamp_leaf<K, V>(
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    leaf: &mut BTreeLeaf<K, V>,
    origin: &Origin,
) {
    if let Origin::Disk { first, .. } = origin {
        wal.copied.push(*first);
        leaf.id = txn.next_page_id();
        leaf.revision = txn.revision();
    }
}

pub(crate) fn stamp_node<K, V>(
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    node: &mut BTreeNode<K>,
    origin: &Origin,
) {
    if let Origin::Disk { first, .. } = origin {
        wal.copied.push(*first);
        node.id = txn.next_page_id();
        node.revision = txn.revision();
    }
}

/// Insert starting from `wal.root`, absorbing a root split into a fresh
/// root node. Leaves the new root in `wal.root`.
pub(crate) fn insert_into_wal<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    key: K,
    value: V,
) -> SnapResult<InsertOutcome<V>> {
    let root = wal.root;
    match insert_rec(ctx, txn, wal, root, key, value)? {
        InsertResult::Done { page, outcome } => {
            wal.root = page;
            Ok(outcome)
        }
        InsertResult::Split {
            pivot,
            left,
            right,
            outcome,
        } => {
            debug!("root split, tree grows one level");
            let new_root = BTreeNode {
                id: txn.next_page_id(),
                revision: txn.revision(),
                keys: vec![pivot],
                children: vec![left, right],
            };
            wal.root = wal.put(BTreePage::Node(new_root));
            Ok(outcome)
        }
    }
}

pub(crate) fn insert_rec<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    page_ref: PageRef,
    key: K,
    value: V,
) -> SnapResult<InsertResult<K, V>> {
    let (page, origin) = load_page(ctx, wal, page_ref)?;
    match page {
        BTreePage::Leaf(leaf) => insert_into_leaf(ctx, txn, wal, leaf, origin, key, value),
        BTreePage::Node(node) => insert_into_node(ctx, txn, wal, node, origin, key, value),
    }
}

fn insert_into_leaf<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    mut leaf: BTreeLeaf<K, V>,
    origin: Origin,
    key: K,
    value: V,
) -> SnapResult<InsertResult<K, V>> {
    match find_pos(&leaf.keys, &key, ctx.key_ser) {
        Ok(pos) => {
            // Key present: the work happens in the value holder.
            if leaf.values[pos].contains(ctx, &value)? {
                let page = restore_page(wal, BTreePage::Leaf(leaf), origin);
                return Ok(InsertResult::Done {
                    page,
                    outcome: InsertOutcome::Exists,
                });
            }

            stamp_leaf(txn, wal, &mut leaf, &origin);
            let outcome = if ctx.allow_duplicates {
                leaf.values[pos].add_value(ctx, txn, value)?;
                InsertOutcome::Added
            } else {
                let old = leaf.values[pos].replace_value(value)?;
                InsertOutcome::Replaced(old)
            };
            Ok(InsertResult::Done {
                page: wal.put(BTreePage::Leaf(leaf)),
                outcome,
            })
        }
        Err(pos) => {
            if leaf.keys.len() < ctx.fanout {
                stamp_leaf(txn, wal, &mut leaf, &origin);
                leaf.keys.insert(pos, key);
                leaf.values.insert(pos, ValueHolder::single(value));
                return Ok(InsertResult::Done {
                    page: wal.put(BTreePage::Leaf(leaf)),
                    outcome: InsertOutcome::Inserted,
                });
            }

            // Full leaf: split into ceil(F/2) entries on the left and the
            // rest on the right; the pivot is the right page's first key.
            if let Origin::Disk { first, .. } = origin {
                wal.copied.push(first);
            }
            leaf.keys.insert(pos, key);
            leaf.values.insert(pos, ValueHolder::single(value));

            let half = ctx.half();
            let right_keys = leaf.keys.split_off(half);
            let right_values = leaf.values.split_off(half);
            let pivot = right_keys[0].clone();

            let left = BTreeLeaf {
                id: txn.next_page_id(),
                revision: txn.revision(),
                keys: leaf.keys,
                values: leaf.values,
            };
            let right = BTreeLeaf {
                id: txn.next_page_id(),
                revision: txn.revision(),
                keys: right_keys,
                values: right_values,
            };
            debug!(
                "leaf split into {} + {} entries",
                left.keys.len(),
                right.keys.len()
            );

            Ok(InsertResult::Split {
                pivot,
                left: wal.put(BTreePage::Leaf(left)),
                right: wal.put(BTreePage::Leaf(right)),
                outcome: InsertOutcome::Inserted,
            })
        }
    }
}

fn insert_into_node<K: Clone, V: Clone>(
    ctx: &TreeCtx<K, V>,
    txn: &mut WriteTransaction,
    wal: &mut TreeWal<K, V>,
    mut node: BTreeNode<K>,
    origin: Origin,
    key: K,
    value: V,
) -> SnapResult<InsertResult<K, V>> {
    let idx = child_index(find_pos(&node.keys, &key, ctx.key_ser));
    let child = node.children[idx];

    match insert_rec(ctx, txn, wal, child, key, value)? {
        InsertResult::Done { page, outcome } => {
            if matches!(outcome, InsertOutcome::Exists) {
                let page = restore_page(wal, BTreePage::Node(node), origin);
                return Ok(InsertResult::Done { page, outcome });
            }
            stamp_node(txn, wal, &mut node, &origin);
            node.children[idx] = page;
            Ok(InsertResult::Done {
                page: wal.put(BTreePage::Node(node)),
                outcome,
            })
        }
        InsertResult::Split {
            pivot,
            left,
            right,
            outcome,
        } => {
            stamp_node(txn, wal, &mut node, &origin);
            node.keys.insert(idx, pivot);
            node.children[idx] = left;
            node.children.insert(idx + 1, right);

            if node.keys.len() <= ctx.fanout {
                return Ok(InsertResult::Done {
                    page: wal.put(BTreePage::Node(node)),
                    outcome,
                });
            }

            // Overflowed node: promote the middle key.
            let mid = node.keys.len() / 2;
            let right_keys = node.keys.split_off(mid + 1);
            let promote = node.keys.pop().expect("overflowed node has a middle key");
            let right_children = node.children.split_off(mid + 1);

            let left_node = BTreeNode {
                id: txn.next_page_id(),
                revision: txn.revision(),
                keys: node.keys,
                children: node.children,
            };
            let right_node = BTreeNode {
                id: txn.next_page_id(),
                revision: txn.revision(),
                keys: right_keys,
                children: right_children,
            };
            debug!(
                "node split into {} + {} keys",
                left_node.keys.len(),
                right_node.keys.len()
            );

            Ok(InsertResult::Split {
                pivot: promote,
                left: wal.put(BTreePage::Node(left_node)),
                right: wal.put(BTreePage::Node(right_node)),
                outcome,
            })
        }
    }
}
