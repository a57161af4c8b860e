use crate::{
    btree::TreeKind,
    paging::Pager,
    types::{Revision, SnapResult},
};

/// One tree modified by a write transaction: its new header record plus
/// the pages the transaction superseded.
pub(crate) struct TreeUpdate {
    pub name: String,
    pub kind: TreeKind,
    pub header_offset: i64,
    pub nb_elems: i64,
    /// First offsets of the records this update made obsolete. Listed in
    /// the copied-pages tree at commit; freed once no reader needs them.
    pub copied: Vec<i64>,
    pub new_tree: bool,
}

/// A single logical write operation. Pages built by the operation are
/// serialized through [`write_record`](WriteTransaction::write_record) so
/// that a rollback can return every allocated page to the free list.
pub struct WriteTransaction {
    revision: Revision,
    allocated: Vec<i64>,
    tree_updates: Vec<TreeUpdate>,
    next_page_id: i64,
}

impl WriteTransaction {
    pub(crate) fn new(revision: Revision) -> Self {
        Self {
            revision,
            allocated: Vec::new(),
            tree_updates: Vec::new(),
            next_page_id: 0,
        }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Page ids only need to be unique within the transaction; the
    /// durable identity of a page is its file offset.
    pub(crate) fn next_page_id(&mut self) -> i64 {
        self.next_page_id += 1;
        self.next_page_id
    }

    pub(crate) fn write_record(&mut self, pager: &Pager, payload: &[u8]) -> SnapResult<(i64, i64)> {
        let (first, last) = pager.write_record(payload)?;
        self.allocated.push(first);
        Ok((first, last))
    }

    pub(crate) fn add_tree_update(&mut self, update: TreeUpdate) {
        self.tree_updates.push(update);
    }

    pub(crate) fn tree_updates(&self) -> &[TreeUpdate] {
        &self.tree_updates
    }

    pub(crate) fn allocated(&self) -> &[i64] {
        &self.allocated
    }
}
