//! The tree facade: public entry points for one named B+tree.
//!
//! Every write is one transaction: take the writer lock, build the new
//! pages copy-on-write, serialize them, then commit through the store
//! (directory and copied-pages updates, header swap). Reads pin a
//! snapshot and navigate offsets that no commit will ever mutate.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::{
    btree::{
        cursor::{KeyCursor, Position, TupleCursor},
        delete::{delete_in_wal, DeleteTarget, RemovedEntry},
        info::BTreeInfo,
        insert::{child_index, insert_into_wal, InsertOutcome},
        page::{find_pos, BTreePage, PageRef},
        tree_header::{read_tree_header, TreeHeader},
        value_holder::ValueHolder,
        wal::{write_pages, TreeCtx, TreeWal},
        TreeKind,
    },
    database::{commit, rollback, StoreInner},
    error::SnapError,
    serializer::Serializer,
    system::{directory_tree, DirectoryKey},
    transaction::{read::ReadTransaction, write::TreeUpdate, WriteTransaction},
    types::{Revision, SnapResult, NO_PAGE},
    utils::HandyRwLock,
};

pub struct BTree<K, V> {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) kind: TreeKind,
    pub(crate) info: BTreeInfo,
    pub(crate) info_offset: i64,
    pub(crate) key_ser: Arc<dyn Serializer<K>>,
    pub(crate) val_ser: Arc<dyn Serializer<V>>,
}

/// One mutation applied to a system tree during commit or reclamation.
pub(crate) enum SystemOp<K, V> {
    Put(K, V),
    Remove(K),
}

pub(crate) struct SystemApplied {
    pub header_offset: i64,
    /// Superseded system records; freed directly once the header swap
    /// lands, never routed through the copied-pages tree.
    pub copied: Vec<i64>,
}

impl<K, V> BTree<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn facade(
        store: Arc<StoreInner>,
        kind: TreeKind,
        info: BTreeInfo,
        info_offset: i64,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
    ) -> Self {
        Self {
            store,
            kind,
            info,
            info_offset,
            key_ser,
            val_ser,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn fanout(&self) -> usize {
        self.info.fanout
    }

    pub fn allow_duplicates(&self) -> bool {
        self.info.allow_duplicates
    }

    pub(crate) fn ctx(&self) -> TreeCtx<'_, K, V> {
        TreeCtx {
            pager: &self.store.pager,
            key_ser: self.key_ser.as_ref(),
            val_ser: self.val_ser.as_ref(),
            fanout: self.info.fanout,
            allow_duplicates: self.info.allow_duplicates,
            inline_threshold: self.store.config.value_inline_threshold,
        }
    }

    /// Offset and content of the latest committed header of this tree.
    pub(crate) fn current_tree_header(&self) -> SnapResult<(i64, TreeHeader)> {
        let offset = {
            let state = self.store.state.rl();
            match self.kind {
                TreeKind::Directory => state.directory_header,
                TreeKind::CopiedPages => state.copied_header,
                _ => state.headers.get(&self.info.name).copied().ok_or_else(|| {
                    SnapError::BTreeCreation(format!("tree {:?} is not managed", self.info.name))
                })?,
            }
        };
        Ok((offset, read_tree_header(&self.store.pager, offset)?))
    }

    pub fn revision(&self) -> SnapResult<Revision> {
        Ok(self.current_tree_header()?.1.revision)
    }

    pub fn nb_elems(&self) -> SnapResult<i64> {
        Ok(self.current_tree_header()?.1.nb_elems)
    }

    // ------------------------------------------------------------ writes

    fn write_op<R>(
        &self,
        op: impl FnOnce(&Self, &mut WriteTransaction) -> SnapResult<R>,
    ) -> SnapResult<R> {
        let _guard = self.store.writer.lock();
        let mut txn = WriteTransaction::new(self.store.next_revision());
        match op(self, &mut txn) {
            Ok(result) => {
                if txn.tree_updates().is_empty() {
                    // nothing changed; there is no revision to publish
                    return Ok(result);
                }
                commit(&self.store, txn)?;
                Ok(result)
            }
            Err(e) => {
                rollback(&self.store, &txn);
                Err(e)
            }
        }
    }

    /// Insert one tuple. With duplicates disabled an existing key has its
    /// value replaced; with duplicates enabled the value joins the key's
    /// set. Re-inserting an existing pair is a no-op reported as
    /// [`InsertOutcome::Exists`].
    pub fn insert(&self, key: K, value: V) -> SnapResult<InsertOutcome<V>> {
        self.write_op(move |tree, txn| tree.insert_in_txn(txn, key, value))
    }

    fn insert_in_txn(
        &self,
        txn: &mut WriteTransaction,
        key: K,
        value: V,
    ) -> SnapResult<InsertOutcome<V>> {
        let (old_header_offset, header) = self.current_tree_header()?;
        let ctx = self.ctx();
        let mut wal = TreeWal::new(PageRef::OnDisk {
            first: header.root_offset,
            last: NO_PAGE,
        });

        let outcome = insert_into_wal(&ctx, txn, &mut wal, key, value)?;
        if matches!(outcome, InsertOutcome::Exists) {
            return Ok(outcome);
        }
        let nb_elems = header.nb_elems + outcome.key_delta();
        self.finish_update(txn, wal, old_header_offset, nb_elems)?;
        Ok(outcome)
    }

    /// Remove a key and every value under it. Returns the removed values,
    /// or `None` if the key was absent.
    pub fn delete(&self, key: &K) -> SnapResult<Option<Vec<V>>> {
        let key = key.clone();
        let removed =
            self.write_op(move |tree, txn| tree.delete_in_txn(txn, key, DeleteTarget::WholeKey))?;
        Ok(removed.map(|entry| entry.values))
    }

    /// Remove one value from a key's set; the key goes too when its set
    /// empties. Returns the removed value, or `None` when the pair was
    /// absent.
    pub fn delete_value(&self, key: &K, value: &V) -> SnapResult<Option<V>> {
        let key = key.clone();
        let value = value.clone();
        let removed = self.write_op(move |tree, txn| {
            tree.delete_in_txn(txn, key, DeleteTarget::OneValue(value))
        })?;
        Ok(removed.and_then(|entry| entry.values.into_iter().next()))
    }

    fn delete_in_txn(
        &self,
        txn: &mut WriteTransaction,
        key: K,
        target: DeleteTarget<V>,
    ) -> SnapResult<Option<RemovedEntry<V>>> {
        let (old_header_offset, header) = self.current_tree_header()?;
        let ctx = self.ctx();
        let mut wal = TreeWal::new(PageRef::OnDisk {
            first: header.root_offset,
            last: NO_PAGE,
        });

        match delete_in_wal(&ctx, txn, &mut wal, key, target)? {
            None => Ok(None),
            Some(entry) => {
                let nb_elems = header.nb_elems - entry.key_removed as i64;
                self.finish_update(txn, wal, old_header_offset, nb_elems)?;
                Ok(Some(entry))
            }
        }
    }

    /// Serialize the transaction's pages bottom-up, write the new tree
    /// header and queue the whole thing for commit.
    fn finish_update(
        &self,
        txn: &mut WriteTransaction,
        mut wal: TreeWal<K, V>,
        old_header_offset: i64,
        nb_elems: i64,
    ) -> SnapResult {
        let ctx = self.ctx();
        let root = wal.root;
        let (root_offset, _) = write_pages(&ctx, txn, &mut wal, &root)?;

        // The superseded header record travels with the superseded pages.
        wal.copied.push(old_header_offset);

        let header = TreeHeader {
            revision: txn.revision(),
            nb_elems,
            root_offset,
            info_offset: self.info_offset,
        };
        let (header_offset, _) = txn.write_record(&self.store.pager, &header.serialize())?;
        debug!(
            "tree {:?}: new header at {:#x}, root {:#x}, {} element(s)",
            self.info.name, header_offset, root_offset, nb_elems
        );

        txn.add_tree_update(TreeUpdate {
            name: self.info.name.clone(),
            kind: self.kind,
            header_offset,
            nb_elems,
            copied: std::mem::take(&mut wal.copied),
            new_tree: false,
        });
        Ok(())
    }

    /// Apply a batch of puts/removes for commit or reclamation. The
    /// caller must hold the writer lock; no user-visible revision is
    /// published here.
    pub(crate) fn system_apply(
        &self,
        txn: &mut WriteTransaction,
        ops: Vec<SystemOp<K, V>>,
    ) -> SnapResult<SystemApplied> {
        let (_old_header_offset, header) = self.current_tree_header()?;
        let ctx = self.ctx();
        let mut wal = TreeWal::new(PageRef::OnDisk {
            first: header.root_offset,
            last: NO_PAGE,
        });
        let mut nb_elems = header.nb_elems;

        for op in ops {
            match op {
                SystemOp::Put(key, value) => {
                    let outcome = insert_into_wal(&ctx, txn, &mut wal, key, value)?;
                    nb_elems += outcome.key_delta();
                }
                SystemOp::Remove(key) => {
                    if let Some(entry) =
                        delete_in_wal(&ctx, txn, &mut wal, key, DeleteTarget::WholeKey)?
                    {
                        nb_elems -= entry.key_removed as i64;
                    }
                }
            }
        }

        let root = wal.root;
        let (root_offset, _) = write_pages(&ctx, txn, &mut wal, &root)?;
        let new_header = TreeHeader {
            revision: txn.revision(),
            nb_elems,
            root_offset,
            info_offset: self.info_offset,
        };
        let (header_offset, _) = txn.write_record(&self.store.pager, &new_header.serialize())?;

        Ok(SystemApplied {
            header_offset,
            copied: std::mem::take(&mut wal.copied),
        })
    }

    // ------------------------------------------------------------- reads

    fn root_header_offset(&self, rt: &ReadTransaction) -> SnapResult<Option<i64>> {
        if rt.is_closed() {
            return Err(SnapError::StaleRead);
        }
        match self.kind {
            TreeKind::User | TreeKind::SubValues => Ok(rt.header_of(&self.info.name)),
            // System tree reads always run under the writer lock against
            // the current state.
            _ => Ok(Some(self.current_tree_header()?.0)),
        }
    }

    fn find_holder(&self, rt: &ReadTransaction, key: &K) -> SnapResult<Option<ValueHolder<V>>> {
        let header_offset = match self.root_header_offset(rt)? {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let header = read_tree_header(&self.store.pager, header_offset)?;
        let ctx = self.ctx();
        let mut offset = header.root_offset;

        loop {
            match ctx.read_page(offset)? {
                BTreePage::Node(node) => {
                    let idx = child_index(find_pos(&node.keys, key, ctx.key_ser));
                    offset = node.children[idx].first_offset().ok_or_else(|| {
                        SnapError::InvalidBTree("committed node references an unwritten page".into())
                    })?;
                }
                BTreePage::Leaf(mut leaf) => {
                    return match find_pos(&leaf.keys, key, ctx.key_ser) {
                        Ok(pos) => Ok(Some(leaf.values.swap_remove(pos))),
                        Err(_) => Ok(None),
                    };
                }
            }
        }
    }

    /// First (smallest) value stored under `key`.
    pub fn get(&self, key: &K) -> SnapResult<Option<V>> {
        let rt = ReadTransaction::begin(&self.store);
        let result = self.get_with(&rt, key);
        rt.close();
        result
    }

    pub fn get_with(&self, rt: &ReadTransaction, key: &K) -> SnapResult<Option<V>> {
        match self.find_holder(rt, key)? {
            None => Ok(None),
            Some(holder) => holder.first_value(&self.ctx()),
        }
    }

    /// Every value stored under `key`, in value order.
    pub fn get_values(&self, key: &K) -> SnapResult<Option<Vec<V>>> {
        let rt = ReadTransaction::begin(&self.store);
        let result = match self.find_holder(&rt, key) {
            Ok(None) => Ok(None),
            Ok(Some(holder)) => holder.values(&self.ctx()).map(Some),
            Err(e) => Err(e),
        };
        rt.close();
        result
    }

    pub fn has_key(&self, key: &K) -> SnapResult<bool> {
        let rt = ReadTransaction::begin(&self.store);
        let result = self.find_holder(&rt, key).map(|h| h.is_some());
        rt.close();
        result
    }

    /// Whether the exact `(key, value)` pair is present.
    pub fn contains(&self, key: &K, value: &V) -> SnapResult<bool> {
        let rt = ReadTransaction::begin(&self.store);
        let result = match self.find_holder(&rt, key) {
            Ok(None) => Ok(false),
            Ok(Some(holder)) => holder.contains(&self.ctx(), value),
            Err(e) => Err(e),
        };
        rt.close();
        result
    }

    // ----------------------------------------------------------- cursors

    fn cursor_parts(
        &self,
        rt: &ReadTransaction,
    ) -> SnapResult<Option<i64>> {
        match self.root_header_offset(rt)? {
            None => Ok(None),
            Some(header_offset) => {
                let header = read_tree_header(&self.store.pager, header_offset)?;
                Ok(Some(header.root_offset))
            }
        }
    }

    pub(crate) fn cursor_at(
        &self,
        rt: ReadTransaction,
        owns_txn: bool,
        position: Position<'_, K>,
    ) -> SnapResult<TupleCursor<K, V>> {
        let root = self.cursor_parts(&rt)?;
        TupleCursor::create(
            Arc::clone(&self.store.pager),
            Arc::clone(&self.key_ser),
            Arc::clone(&self.val_ser),
            rt,
            owns_txn,
            root,
            position,
        )
    }

    /// Cursor over every tuple, parked before the first one.
    pub fn browse(&self) -> SnapResult<TupleCursor<K, V>> {
        let rt = ReadTransaction::begin(&self.store);
        self.cursor_at(rt, true, Position::First)
    }

    /// Cursor parked just before the first key at or after `key`.
    pub fn browse_from(&self, key: &K) -> SnapResult<TupleCursor<K, V>> {
        let rt = ReadTransaction::begin(&self.store);
        self.cursor_at(rt, true, Position::Key(key))
    }

    /// Cursor parked after the last tuple, for backward iteration.
    pub fn browse_end(&self) -> SnapResult<TupleCursor<K, V>> {
        let rt = ReadTransaction::begin(&self.store);
        self.cursor_at(rt, true, Position::Last)
    }

    /// Cursor sharing a caller-managed snapshot, so several trees can be
    /// read at the same revision.
    pub fn browse_with(&self, rt: &ReadTransaction) -> SnapResult<TupleCursor<K, V>> {
        self.cursor_at(rt.clone(), false, Position::First)
    }

    /// Key-only cursor.
    pub fn browse_keys(&self) -> SnapResult<KeyCursor<K, V>> {
        let rt = ReadTransaction::begin(&self.store);
        let root = self.cursor_parts(&rt)?;
        KeyCursor::create(
            Arc::clone(&self.store.pager),
            Arc::clone(&self.key_ser),
            Arc::clone(&self.val_ser),
            rt,
            true,
            root,
        )
    }

    /// Browse the tree as of a historical revision, if that revision is
    /// still on disk. Pins the revision against reclamation for the life
    /// of the cursor.
    pub fn browse_at(&self, revision: Revision) -> SnapResult<Option<TupleCursor<K, V>>> {
        // Directory pages are freed directly at commit, so the lookup
        // runs under the writer lock.
        let found = {
            let _guard = self.store.writer.lock();
            let dir = directory_tree(&self.store);
            dir.floor_entry(&DirectoryKey {
                name: self.info.name.to_string(),
                revision,
            })?
        };

        let (key, header_offset) = match found {
            Some((key, offset)) if key.name == self.info.name => (key, offset),
            _ => return Ok(None),
        };

        let mut headers = HashMap::new();
        headers.insert(self.info.name.clone(), header_offset);
        let rt = ReadTransaction::pinned(&self.store, key.revision, headers);

        // The pin may have lost a race against an in-flight reclamation.
        if key.revision < self.store.state.rl().reclaim_floor {
            rt.close();
            return Ok(None);
        }

        self.cursor_at(rt, true, Position::First).map(Some)
    }

    // ------------------------------------------- system-tree navigation

    /// Greatest entry at or below `key`. Callers on system trees must
    /// hold the writer lock.
    pub(crate) fn floor_entry(&self, key: &K) -> SnapResult<Option<(K, V)>> {
        let (_offset, header) = self.current_tree_header()?;
        let ctx = self.ctx();
        let mut offset = header.root_offset;
        // Rightmost subtree strictly left of the descent path; its
        // maximum is the floor when the target leaf has nothing <= key.
        let mut fallback: Option<i64> = None;

        loop {
            match ctx.read_page(offset)? {
                BTreePage::Node(node) => {
                    let idx = child_index(find_pos(&node.keys, key, ctx.key_ser));
                    if idx > 0 {
                        fallback = node.children[idx - 1].first_offset();
                    }
                    offset = node.children[idx].first_offset().ok_or_else(|| {
                        SnapError::InvalidBTree("committed node references an unwritten page".into())
                    })?;
                }
                BTreePage::Leaf(mut leaf) => {
                    let pos = match find_pos(&leaf.keys, key, ctx.key_ser) {
                        Ok(pos) => Some(pos),
                        Err(0) => None,
                        Err(pos) => Some(pos - 1),
                    };
                    return match pos {
                        Some(pos) => {
                            let k = leaf.keys.swap_remove(pos);
                            let holder = leaf.values.swap_remove(pos);
                            Ok(holder.first_value(&ctx)?.map(|v| (k, v)))
                        }
                        None => match fallback {
                            None => Ok(None),
                            Some(prev) => self.rightmost_entry(prev),
                        },
                    };
                }
            }
        }
    }

    fn rightmost_entry(&self, mut offset: i64) -> SnapResult<Option<(K, V)>> {
        let ctx = self.ctx();
        loop {
            match ctx.read_page(offset)? {
                BTreePage::Node(node) => {
                    offset = node
                        .children
                        .last()
                        .and_then(|c| c.first_offset())
                        .ok_or_else(|| {
                            SnapError::InvalidBTree(
                                "committed node references an unwritten page".into(),
                            )
                        })?;
                }
                BTreePage::Leaf(mut leaf) => {
                    return match leaf.keys.len() {
                        0 => Ok(None),
                        n => {
                            let k = leaf.keys.swap_remove(n - 1);
                            let holder = leaf.values.swap_remove(n - 1);
                            Ok(holder.first_value(&ctx)?.map(|v| (k, v)))
                        }
                    };
                }
            }
        }
    }

    /// Every `(key, first value)` pair, in key order. System-tree scans
    /// only; value sets are not expanded.
    pub(crate) fn scan_all(&self) -> SnapResult<Vec<(K, V)>> {
        let (_offset, header) = self.current_tree_header()?;
        let ctx = self.ctx();
        let mut out = Vec::new();
        self.scan_rec(&ctx, header.root_offset, &mut out)?;
        Ok(out)
    }

    fn scan_rec(
        &self,
        ctx: &TreeCtx<'_, K, V>,
        offset: i64,
        out: &mut Vec<(K, V)>,
    ) -> SnapResult {
        match ctx.read_page(offset)? {
            BTreePage::Leaf(leaf) => {
                for (key, holder) in leaf.keys.into_iter().zip(leaf.values.into_iter()) {
                    let value = holder.first_value(ctx)?.ok_or_else(|| {
                        SnapError::InvalidBTree("entry with an empty value holder".into())
                    })?;
                    out.push((key, value));
                }
                Ok(())
            }
            BTreePage::Node(node) => {
                for child in node.children {
                    let first = child.first_offset().ok_or_else(|| {
                        SnapError::InvalidBTree("committed node references an unwritten page".into())
                    })?;
                    self.scan_rec(ctx, first, out)?;
                }
                Ok(())
            }
        }
    }
}
