//! On-disk page layout.
//!
//! Leaves and nodes share a common record header: page id, revision, then
//! the entry count. The count is stored negated for nodes, which is how a
//! reader tells the two apart. An empty leaf (the root of an empty tree)
//! stores nothing but the header fields.

use bytes::Bytes;

use crate::{
    btree::{leaf::BTreeLeaf, node::BTreeNode, value_holder::ValueHolder},
    error::SnapError,
    io::{SnapReader, SnapWriter},
    serializer::Serializer,
    types::SnapResult,
};

/// Where a child or root page lives: already on disk, or still in the
/// write transaction's page set waiting to be serialized at commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageRef {
    OnDisk { first: i64, last: i64 },
    Wal { id: i64 },
}

impl PageRef {
    pub fn is_wal(&self) -> bool {
        matches!(self, PageRef::Wal { .. })
    }

    pub fn first_offset(&self) -> Option<i64> {
        match self {
            PageRef::OnDisk { first, .. } => Some(*first),
            PageRef::Wal { .. } => None,
        }
    }
}

/// Binary search scaffold shared by every page operation: `Ok(pos)` for an
/// exact hit, `Err(pos)` for the slot where the key would be inserted.
pub(crate) fn find_pos<T>(items: &[T], key: &T, ser: &dyn Serializer<T>) -> Result<usize, usize> {
    items.binary_search_by(|probe| ser.compare(probe, key))
}

// ------------------------------------------------------------------- raw

/// Structure of a page before keys and values are given to serializers.
/// The inspector works on this level; the typed deserializer builds on it.
pub(crate) enum RawPage {
    Leaf(RawLeaf),
    Node(RawNode),
}

pub(crate) struct RawLeaf {
    pub id: i64,
    pub revision: i64,
    pub entries: Vec<RawLeafEntry>,
}

pub(crate) struct RawLeafEntry {
    pub values: RawValues,
    pub key: Bytes,
}

pub(crate) enum RawValues {
    Inline { nb: usize, data: Bytes },
    SubTree { nb: i64, header_offset: i64 },
}

pub(crate) struct RawNode {
    pub id: i64,
    pub revision: i64,
    pub keys: Vec<Bytes>,
    pub children: Vec<(i64, i64)>,
}

impl RawPage {
    pub fn parse(bytes: Bytes) -> SnapResult<RawPage> {
        let mut r = SnapReader::new(bytes);
        let id = r.get_i64()?;
        let revision = r.get_i64()?;
        let nb_elems = r.get_i32()?;

        if nb_elems == 0 {
            return Ok(RawPage::Leaf(RawLeaf {
                id,
                revision,
                entries: Vec::new(),
            }));
        }

        let payload_size = r.get_i32()?;
        if payload_size < 0 || payload_size as usize != r.remaining() {
            return Err(SnapError::InvalidBTree(format!(
                "page {} claims {} payload bytes but record holds {}",
                id,
                payload_size,
                r.remaining()
            )));
        }

        if nb_elems > 0 {
            let mut entries = Vec::with_capacity(nb_elems as usize);
            for _ in 0..nb_elems {
                let nb_values = r.get_i32()?;
                let values = if nb_values >= 0 {
                    let data = r.get_bytes()?;
                    RawValues::Inline {
                        nb: nb_values as usize,
                        data,
                    }
                } else {
                    RawValues::SubTree {
                        nb: -(nb_values as i64),
                        header_offset: r.get_i64()?,
                    }
                };
                let key = r.get_bytes()?;
                entries.push(RawLeafEntry { values, key });
            }
            Ok(RawPage::Leaf(RawLeaf {
                id,
                revision,
                entries,
            }))
        } else {
            let nb = (-nb_elems) as usize;
            let mut keys = Vec::with_capacity(nb);
            let mut children = Vec::with_capacity(nb + 1);
            for _ in 0..nb {
                let first = r.get_i64()?;
                let last = r.get_i64()?;
                children.push((first, last));
                keys.push(r.get_bytes()?);
            }
            let first = r.get_i64()?;
            let last = r.get_i64()?;
            children.push((first, last));
            Ok(RawPage::Node(RawNode {
                id,
                revision,
                keys,
                children,
            }))
        }
    }
}

// ----------------------------------------------------------------- typed

pub(crate) enum BTreePage<K, V> {
    Leaf(BTreeLeaf<K, V>),
    Node(BTreeNode<K>),
}

impl<K, V> BTreePage<K, V> {
    pub fn id(&self) -> i64 {
        match self {
            BTreePage::Leaf(l) => l.id,
            BTreePage::Node(n) => n.id,
        }
    }

    pub fn nb_entries(&self) -> usize {
        match self {
            BTreePage::Leaf(l) => l.keys.len(),
            BTreePage::Node(n) => n.keys.len(),
        }
    }

    pub fn set_stamp(&mut self, id: i64, revision: i64) {
        match self {
            BTreePage::Leaf(l) => {
                l.id = id;
                l.revision = revision;
            }
            BTreePage::Node(n) => {
                n.id = id;
                n.revision = revision;
            }
        }
    }

    pub fn deserialize(
        bytes: Bytes,
        key_ser: &dyn Serializer<K>,
        val_ser: &dyn Serializer<V>,
    ) -> SnapResult<Self>
    where
        V: Clone,
    {
        match RawPage::parse(bytes)? {
            RawPage::Leaf(raw) => {
                let mut keys = Vec::with_capacity(raw.entries.len());
                let mut values = Vec::with_capacity(raw.entries.len());
                for entry in raw.entries {
                    let holder = match entry.values {
                        RawValues::Inline { nb, data } => {
                            let mut vr = SnapReader::new(data);
                            let mut vals = Vec::with_capacity(nb);
                            for _ in 0..nb {
                                vals.push(val_ser.deserialize(&mut vr)?);
                            }
                            ValueHolder::Inline(vals)
                        }
                        RawValues::SubTree { nb, header_offset } => {
                            ValueHolder::sub_tree(header_offset, nb)
                        }
                    };
                    let mut kr = SnapReader::new(entry.key);
                    keys.push(key_ser.deserialize(&mut kr)?);
                    values.push(holder);
                }
                Ok(BTreePage::Leaf(BTreeLeaf {
                    id: raw.id,
                    revision: raw.revision,
                    keys,
                    values,
                }))
            }
            RawPage::Node(raw) => {
                let mut keys = Vec::with_capacity(raw.keys.len());
                for key in raw.keys {
                    let mut kr = SnapReader::new(key);
                    keys.push(key_ser.deserialize(&mut kr)?);
                }
                let children = raw
                    .children
                    .into_iter()
                    .map(|(first, last)| PageRef::OnDisk { first, last })
                    .collect();
                Ok(BTreePage::Node(BTreeNode {
                    id: raw.id,
                    revision: raw.revision,
                    keys,
                    children,
                }))
            }
        }
    }

    pub fn serialize(
        &self,
        key_ser: &dyn Serializer<K>,
        val_ser: &dyn Serializer<V>,
    ) -> SnapResult<Vec<u8>> {
        let mut w = SnapWriter::new();
        match self {
            BTreePage::Leaf(leaf) => {
                w.put_i64(leaf.id);
                w.put_i64(leaf.revision);
                w.put_i32(leaf.keys.len() as i32);
                if leaf.keys.is_empty() {
                    return Ok(w.freeze().to_vec());
                }

                let mut body = SnapWriter::new();
                for (key, holder) in leaf.keys.iter().zip(leaf.values.iter()) {
                    match holder {
                        ValueHolder::Inline(vals) => {
                            body.put_i32(vals.len() as i32);
                            let mut blob = Vec::new();
                            for v in vals {
                                blob.extend_from_slice(&val_ser.serialize(v));
                            }
                            body.put_bytes(&blob);
                        }
                        ValueHolder::SubTree(sub) => {
                            if sub.dirty.is_some() {
                                return Err(SnapError::InvalidBTree(
                                    "value tree not flushed before page serialization"
                                        .to_string(),
                                ));
                            }
                            body.put_i32(-(sub.count as i32));
                            body.put_i64(sub.header_offset);
                        }
                    }
                    body.put_bytes(&key_ser.serialize(key));
                }
                w.put_i32(body.len() as i32);
                let body = body.freeze();
                w.put_raw(&body);
            }
            BTreePage::Node(node) => {
                w.put_i64(node.id);
                w.put_i64(node.revision);
                w.put_i32(-(node.keys.len() as i32));

                let mut body = SnapWriter::new();
                for (key, child) in node.keys.iter().zip(node.children.iter()) {
                    let (first, last) = child_offsets(child)?;
                    body.put_i64(first);
                    body.put_i64(last);
                    body.put_bytes(&key_ser.serialize(key));
                }
                let (first, last) = child_offsets(
                    node.children
                        .last()
                        .ok_or_else(|| SnapError::InvalidBTree("node without children".into()))?,
                )?;
                body.put_i64(first);
                body.put_i64(last);
                w.put_i32(body.len() as i32);
                let body = body.freeze();
                w.put_raw(&body);
            }
        }
        Ok(w.freeze().to_vec())
    }
}

fn child_offsets(child: &PageRef) -> SnapResult<(i64, i64)> {
    match child {
        PageRef::OnDisk { first, last } => Ok((*first, *last)),
        PageRef::Wal { id } => Err(SnapError::InvalidBTree(format!(
            "child page {} was not serialized before its parent",
            id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{I64Serializer, StringSerializer};

    #[test]
    fn test_leaf_round_trip() {
        let leaf: BTreePage<i64, String> = BTreePage::Leaf(BTreeLeaf {
            id: 3,
            revision: 9,
            keys: vec![1, 5, 9],
            values: vec![
                ValueHolder::Inline(vec!["a".to_string()]),
                ValueHolder::Inline(vec!["b".to_string(), "c".to_string()]),
                ValueHolder::sub_tree(4096, 100),
            ],
        });

        let bytes = leaf.serialize(&I64Serializer, &StringSerializer).unwrap();
        let parsed: BTreePage<i64, String> =
            BTreePage::deserialize(Bytes::from(bytes), &I64Serializer, &StringSerializer).unwrap();

        match parsed {
            BTreePage::Leaf(l) => {
                assert_eq!(l.id, 3);
                assert_eq!(l.revision, 9);
                assert_eq!(l.keys, vec![1, 5, 9]);
                match &l.values[1] {
                    ValueHolder::Inline(vals) => assert_eq!(vals, &vec!["b".to_string(), "c".to_string()]),
                    _ => panic!("expected inline values"),
                }
                match &l.values[2] {
                    ValueHolder::SubTree(sub) => {
                        assert_eq!(sub.header_offset, 4096);
                        assert_eq!(sub.count, 100);
                    }
                    _ => panic!("expected a value tree"),
                }
            }
            _ => panic!("expected a leaf"),
        }
    }

    #[test]
    fn test_empty_leaf_round_trip() {
        let leaf: BTreePage<i64, i64> = BTreePage::Leaf(BTreeLeaf::new_empty(1, 0));
        let bytes = leaf.serialize(&I64Serializer, &I64Serializer).unwrap();
        // id + revision + count, nothing else
        assert_eq!(bytes.len(), 20);
        let parsed: BTreePage<i64, i64> =
            BTreePage::deserialize(Bytes::from(bytes), &I64Serializer, &I64Serializer).unwrap();
        assert_eq!(parsed.nb_entries(), 0);
    }

    #[test]
    fn test_node_round_trip() {
        let node: BTreePage<i64, i64> = BTreePage::Node(BTreeNode {
            id: 7,
            revision: 2,
            keys: vec![10, 20],
            children: vec![
                PageRef::OnDisk { first: 512, last: 512 },
                PageRef::OnDisk { first: 1024, last: 1536 },
                PageRef::OnDisk { first: 2048, last: 2048 },
            ],
        });

        let bytes = node.serialize(&I64Serializer, &I64Serializer).unwrap();
        let parsed: BTreePage<i64, i64> =
            BTreePage::deserialize(Bytes::from(bytes), &I64Serializer, &I64Serializer).unwrap();
        match parsed {
            BTreePage::Node(n) => {
                assert_eq!(n.keys, vec![10, 20]);
                assert_eq!(n.children.len(), 3);
                assert_eq!(n.children[1], PageRef::OnDisk { first: 1024, last: 1536 });
            }
            _ => panic!("expected a node"),
        }
    }

    #[test]
    fn test_find_pos_convention() {
        let ser = I64Serializer;
        let keys = vec![10i64, 20, 30];
        assert_eq!(find_pos(&keys, &20, &ser), Ok(1));
        assert_eq!(find_pos(&keys, &5, &ser), Err(0));
        assert_eq!(find_pos(&keys, &25, &ser), Err(2));
        assert_eq!(find_pos(&keys, &35, &ser), Err(3));
    }
}
