//! Stack-based cursors.
//!
//! A cursor holds the path from the root to its current leaf as a stack
//! of `(page, position)` pairs. Forward movement walks the current leaf,
//! then unwinds to the nearest ancestor with another child and descends
//! its leftmost edge; backward movement mirrors that. The parking states
//! "before first" and "after last" are ordinary positions one step off
//! either end.

use std::sync::Arc;

use crate::{
    btree::{
        insert::child_index,
        page::{find_pos, BTreePage, PageRef},
        tree_header::read_tree_header,
        value_holder::ValueHolder,
    },
    error::SnapError,
    paging::Pager,
    serializer::{Serializer, UnitSerializer},
    transaction::ReadTransaction,
    types::{Revision, SnapResult},
};

pub(crate) enum Position<'a, K> {
    First,
    Last,
    Key(&'a K),
}

struct Level<K, V> {
    page: BTreePage<K, V>,
    /// Child index in a node, entry index in the leaf; -1 parks before
    /// the first entry, `len` parks after the last.
    pos: isize,
}

pub(crate) struct PageCursor<K, V> {
    pager: Arc<Pager>,
    key_ser: Arc<dyn Serializer<K>>,
    val_ser: Arc<dyn Serializer<V>>,
    read: ReadTransaction,
    owns_txn: bool,
    stack: Vec<Level<K, V>>,
}

impl<K, V> PageCursor<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn create(
        pager: Arc<Pager>,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        read: ReadTransaction,
        owns_txn: bool,
        root_offset: Option<i64>,
        position: Position<'_, K>,
    ) -> SnapResult<Self> {
        let mut cursor = Self {
            pager,
            key_ser,
            val_ser,
            read,
            owns_txn,
            stack: Vec::new(),
        };
        if let Some(root) = root_offset {
            match position {
                Position::First => cursor.descend_edge(root, true)?,
                Position::Last => cursor.descend_edge(root, false)?,
                Position::Key(key) => cursor.descend_to(root, key)?,
            }
        }
        Ok(cursor)
    }

    fn read_page(&self, offset: i64) -> SnapResult<BTreePage<K, V>> {
        let max = self.pager.file_size() as usize;
        let bytes = self.pager.read_record(offset, max)?;
        BTreePage::deserialize(bytes, self.key_ser.as_ref(), self.val_ser.as_ref())
    }

    fn child_first(child: PageRef) -> SnapResult<i64> {
        child.first_offset().ok_or_else(|| {
            SnapError::InvalidBTree("committed node references an unwritten page".to_string())
        })
    }

    /// Push the leftmost (or rightmost) path below `offset`, parking the
    /// leaf one step outside its entries.
    fn descend_edge(&mut self, mut offset: i64, leftmost: bool) -> SnapResult {
        loop {
            let page = self.read_page(offset)?;
            let (pos, next) = match &page {
                BTreePage::Node(node) => {
                    let pos = if leftmost { 0 } else { node.children.len() - 1 };
                    (pos as isize, Some(Self::child_first(node.children[pos])?))
                }
                BTreePage::Leaf(leaf) => {
                    let pos = if leftmost { -1 } else { leaf.keys.len() as isize };
                    (pos, None)
                }
            };
            self.stack.push(Level { page, pos });
            match next {
                Some(child) => offset = child,
                None => return Ok(()),
            }
        }
    }

    /// Position so the next step forward lands on the first key at or
    /// after `key`.
    fn descend_to(&mut self, mut offset: i64, key: &K) -> SnapResult {
        loop {
            let page = self.read_page(offset)?;
            let (pos, next) = match &page {
                BTreePage::Node(node) => {
                    let idx = child_index(find_pos(&node.keys, key, self.key_ser.as_ref()));
                    (idx as isize, Some(Self::child_first(node.children[idx])?))
                }
                BTreePage::Leaf(leaf) => {
                    let pos = match find_pos(&leaf.keys, key, self.key_ser.as_ref()) {
                        Ok(pos) => pos,
                        Err(pos) => pos,
                    };
                    (pos as isize - 1, None)
                }
            };
            self.stack.push(Level { page, pos });
            match next {
                Some(child) => offset = child,
                None => return Ok(()),
            }
        }
    }

    pub fn next_entry(&mut self) -> SnapResult<Option<(K, ValueHolder<V>)>> {
        if self.read.is_closed() {
            return Err(SnapError::StaleRead);
        }
        loop {
            if self.stack.is_empty() {
                return Ok(None);
            }

            let stepped = {
                let top = self.stack.last_mut().expect("stack not empty");
                match &top.page {
                    BTreePage::Leaf(leaf) => {
                        if top.pos + 1 < leaf.keys.len() as isize {
                            top.pos += 1;
                            let pos = top.pos as usize;
                            Some((leaf.keys[pos].clone(), leaf.values[pos].clone()))
                        } else {
                            None
                        }
                    }
                    BTreePage::Node(_) => {
                        return Err(SnapError::InvalidBTree(
                            "cursor stack does not end at a leaf".to_string(),
                        ))
                    }
                }
            };
            if let Some(entry) = stepped {
                return Ok(Some(entry));
            }

            // Deepest ancestor that still has a child to the right.
            let mut ancestor = None;
            for i in (0..self.stack.len().saturating_sub(1)).rev() {
                if let BTreePage::Node(node) = &self.stack[i].page {
                    if self.stack[i].pos + 1 < node.children.len() as isize {
                        ancestor = Some(i);
                        break;
                    }
                }
            }
            let ancestor = match ancestor {
                Some(i) => i,
                None => {
                    // Park after the last entry.
                    let top = self.stack.last_mut().expect("stack not empty");
                    if let BTreePage::Leaf(leaf) = &top.page {
                        top.pos = leaf.keys.len() as isize;
                    }
                    return Ok(None);
                }
            };

            self.stack.truncate(ancestor + 1);
            let child = {
                let level = self.stack.last_mut().expect("stack not empty");
                level.pos += 1;
                match &level.page {
                    BTreePage::Node(node) => node.children[level.pos as usize],
                    BTreePage::Leaf(_) => {
                        return Err(SnapError::InvalidBTree(
                            "cursor ancestor is not a node".to_string(),
                        ))
                    }
                }
            };
            let offset = Self::child_first(child)?;
            self.descend_edge(offset, true)?;
        }
    }

    pub fn prev_entry(&mut self) -> SnapResult<Option<(K, ValueHolder<V>)>> {
        if self.read.is_closed() {
            return Err(SnapError::StaleRead);
        }
        loop {
            if self.stack.is_empty() {
                return Ok(None);
            }

            let stepped = {
                let top = self.stack.last_mut().expect("stack not empty");
                match &top.page {
                    BTreePage::Leaf(leaf) => {
                        if top.pos > 0 {
                            top.pos -= 1;
                            let pos = top.pos as usize;
                            Some((leaf.keys[pos].clone(), leaf.values[pos].clone()))
                        } else {
                            None
                        }
                    }
                    BTreePage::Node(_) => {
                        return Err(SnapError::InvalidBTree(
                            "cursor stack does not end at a leaf".to_string(),
                        ))
                    }
                }
            };
            if let Some(entry) = stepped {
                return Ok(Some(entry));
            }

            let mut ancestor = None;
            for i in (0..self.stack.len().saturating_sub(1)).rev() {
                if matches!(&self.stack[i].page, BTreePage::Node(_)) && self.stack[i].pos > 0 {
                    ancestor = Some(i);
                    break;
                }
            }
            let ancestor = match ancestor {
                Some(i) => i,
                None => {
                    // Park before the first entry.
                    let top = self.stack.last_mut().expect("stack not empty");
                    top.pos = -1;
                    return Ok(None);
                }
            };

            self.stack.truncate(ancestor + 1);
            let child = {
                let level = self.stack.last_mut().expect("stack not empty");
                level.pos -= 1;
                match &level.page {
                    BTreePage::Node(node) => node.children[level.pos as usize],
                    BTreePage::Leaf(_) => {
                        return Err(SnapError::InvalidBTree(
                            "cursor ancestor is not a node".to_string(),
                        ))
                    }
                }
            };
            let offset = Self::child_first(child)?;
            self.descend_edge(offset, false)?;
        }
    }
}

impl<K, V> Drop for PageCursor<K, V> {
    fn drop(&mut self) {
        if self.owns_txn {
            self.read.close();
        }
    }
}

// ----------------------------------------------------------------- tuple

enum ValuesCursor<V> {
    Inline { values: Vec<V>, pos: isize },
    Sub(Box<PageCursor<V, ()>>),
}

impl<V> ValuesCursor<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn next(&mut self) -> SnapResult<Option<V>> {
        match self {
            ValuesCursor::Inline { values, pos } => {
                if *pos + 1 < values.len() as isize {
                    *pos += 1;
                    Ok(Some(values[*pos as usize].clone()))
                } else {
                    *pos = values.len() as isize;
                    Ok(None)
                }
            }
            ValuesCursor::Sub(cursor) => Ok(cursor.next_entry()?.map(|(v, _)| v)),
        }
    }

    fn prev(&mut self) -> SnapResult<Option<V>> {
        match self {
            ValuesCursor::Inline { values, pos } => {
                if *pos > 0 {
                    *pos -= 1;
                    Ok(Some(values[*pos as usize].clone()))
                } else {
                    *pos = -1;
                    Ok(None)
                }
            }
            ValuesCursor::Sub(cursor) => Ok(cursor.prev_entry()?.map(|(v, _)| v)),
        }
    }
}

/// Cursor over `(key, value)` tuples: a key with several values yields
/// one tuple per value, in value order.
pub struct TupleCursor<K, V> {
    inner: PageCursor<K, V>,
    current: Option<(K, ValuesCursor<V>)>,
}

impl<K, V> TupleCursor<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        pager: Arc<Pager>,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        read: ReadTransaction,
        owns_txn: bool,
        root_offset: Option<i64>,
        position: Position<'_, K>,
    ) -> SnapResult<Self> {
        Ok(Self {
            inner: PageCursor::create(
                pager, key_ser, val_ser, read, owns_txn, root_offset, position,
            )?,
            current: None,
        })
    }

    /// Revision this cursor is pinned to.
    pub fn revision(&self) -> Revision {
        self.inner.read.revision()
    }

    pub fn next_tuple(&mut self) -> SnapResult<Option<(K, V)>> {
        loop {
            if let Some((key, values)) = self.current.as_mut() {
                if let Some(value) = values.next()? {
                    return Ok(Some((key.clone(), value)));
                }
                self.current = None;
            }
            match self.inner.next_entry()? {
                None => return Ok(None),
                Some((key, holder)) => {
                    let values = self.values_cursor(holder, true)?;
                    self.current = Some((key, values));
                }
            }
        }
    }

    pub fn prev_tuple(&mut self) -> SnapResult<Option<(K, V)>> {
        loop {
            if let Some((key, values)) = self.current.as_mut() {
                if let Some(value) = values.prev()? {
                    return Ok(Some((key.clone(), value)));
                }
                self.current = None;
            }
            match self.inner.prev_entry()? {
                None => return Ok(None),
                Some((key, holder)) => {
                    let values = self.values_cursor(holder, false)?;
                    self.current = Some((key, values));
                }
            }
        }
    }

    fn values_cursor(&self, holder: ValueHolder<V>, forward: bool) -> SnapResult<ValuesCursor<V>> {
        match holder {
            ValueHolder::Inline(values) => Ok(ValuesCursor::Inline {
                pos: if forward { -1 } else { values.len() as isize },
                values,
            }),
            ValueHolder::SubTree(sub) => {
                let header = read_tree_header(&self.inner.pager, sub.header_offset)?;
                let cursor = PageCursor::create(
                    Arc::clone(&self.inner.pager),
                    Arc::clone(&self.inner.val_ser),
                    Arc::new(UnitSerializer),
                    self.inner.read.clone(),
                    false,
                    Some(header.root_offset),
                    if forward { Position::First } else { Position::Last },
                )?;
                Ok(ValuesCursor::Sub(Box::new(cursor)))
            }
        }
    }
}

impl<K, V> Iterator for TupleCursor<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = SnapResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tuple().transpose()
    }
}

// ------------------------------------------------------------------ keys

/// Cursor over keys only; value sets are skipped, not expanded.
pub struct KeyCursor<K, V> {
    inner: PageCursor<K, V>,
}

impl<K, V> KeyCursor<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn create(
        pager: Arc<Pager>,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        read: ReadTransaction,
        owns_txn: bool,
        root_offset: Option<i64>,
    ) -> SnapResult<Self> {
        Ok(Self {
            inner: PageCursor::create(
                pager,
                key_ser,
                val_ser,
                read,
                owns_txn,
                root_offset,
                Position::First,
            )?,
        })
    }

    pub fn next_key(&mut self) -> SnapResult<Option<K>> {
        Ok(self.inner.next_entry()?.map(|(key, _)| key))
    }

    pub fn prev_key(&mut self) -> SnapResult<Option<K>> {
        Ok(self.inner.prev_entry()?.map(|(key, _)| key))
    }
}

impl<K, V> Iterator for KeyCursor<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = SnapResult<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_key().transpose()
    }
}
