use crate::btree::value_holder::ValueHolder;

/// A leaf page: sorted keys, one value holder per key.
pub(crate) struct BTreeLeaf<K, V> {
    pub id: i64,
    pub revision: i64,
    pub keys: Vec<K>,
    pub values: Vec<ValueHolder<V>>,
}

impl<K, V> BTreeLeaf<K, V> {
    pub fn new_empty(id: i64, revision: i64) -> Self {
        Self {
            id,
            revision,
            keys: Vec::new(),
            values: Vec::new(),
        }
    }
}
