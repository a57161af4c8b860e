use crate::btree::page::PageRef;

/// An internal page: N sorted separator keys and N+1 children. A
/// separator always equals the leftmost leaf key of its right subtree.
pub(crate) struct BTreeNode<K> {
    pub id: i64,
    pub revision: i64,
    pub keys: Vec<K>,
    pub children: Vec<PageRef>,
}
