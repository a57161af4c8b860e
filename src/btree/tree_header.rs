use bytes::Bytes;

use crate::{
    io::{SnapReader, SnapWriter},
    paging::Pager,
    types::{Revision, SnapResult},
};

/// One committed revision of one tree: the root pointer plus bookkeeping.
/// A fresh header record is written at every commit that touches the tree;
/// old ones stay reachable through the directory until their revision is
/// reclaimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeHeader {
    pub revision: Revision,
    pub nb_elems: i64,
    pub root_offset: i64,
    pub info_offset: i64,
}

/// Serialized size: four i64 fields.
pub const TREE_HEADER_SIZE: usize = 32;

impl TreeHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = SnapWriter::with_capacity(TREE_HEADER_SIZE);
        w.put_i64(self.revision);
        w.put_i64(self.nb_elems);
        w.put_i64(self.root_offset);
        w.put_i64(self.info_offset);
        w.freeze().to_vec()
    }

    pub fn deserialize(bytes: Bytes) -> SnapResult<Self> {
        let mut r = SnapReader::new(bytes);
        Ok(Self {
            revision: r.get_i64()?,
            nb_elems: r.get_i64()?,
            root_offset: r.get_i64()?,
            info_offset: r.get_i64()?,
        })
    }
}

/// Read a tree header record straight from the pager.
pub(crate) fn read_tree_header(pager: &Pager, offset: i64) -> SnapResult<TreeHeader> {
    TreeHeader::deserialize(pager.read_record(offset, TREE_HEADER_SIZE)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let h = TreeHeader {
            revision: 12,
            nb_elems: 4096,
            root_offset: 8192,
            info_offset: 512,
        };
        let bytes = h.serialize();
        assert_eq!(bytes.len(), TREE_HEADER_SIZE);
        assert_eq!(TreeHeader::deserialize(Bytes::from(bytes)).unwrap(), h);
    }
}
