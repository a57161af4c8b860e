use bytes::Bytes;

use crate::{
    error::SnapError,
    io::{SnapReader, SnapWriter},
    types::SnapResult,
};

/// Immutable per-tree metadata, written once when the tree is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BTreeInfo {
    pub fanout: usize,
    pub name: String,
    pub key_serializer: String,
    pub value_serializer: String,
    pub allow_duplicates: bool,
}

impl BTreeInfo {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = SnapWriter::new();
        w.put_i32(self.fanout as i32);
        w.put_str(&self.name);
        w.put_str(&self.key_serializer);
        w.put_str(&self.value_serializer);
        w.put_i32(self.allow_duplicates as i32);
        w.freeze().to_vec()
    }

    pub fn deserialize(bytes: Bytes) -> SnapResult<Self> {
        let mut r = SnapReader::new(bytes);
        let fanout = r.get_i32()?;
        if fanout < 2 {
            return Err(SnapError::InvalidBTree(format!(
                "tree fanout {} out of range",
                fanout
            )));
        }
        let name = r.get_str()?;
        let key_serializer = r.get_str()?;
        let value_serializer = r.get_str()?;
        let allow_duplicates = match r.get_i32()? {
            0 => false,
            1 => true,
            other => {
                return Err(SnapError::InvalidBTree(format!(
                    "duplicates flag must be 0 or 1, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            fanout: fanout as usize,
            name,
            key_serializer,
            value_serializer,
            allow_duplicates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let info = BTreeInfo {
            fanout: 16,
            name: "users".to_string(),
            key_serializer: "i64".to_string(),
            value_serializer: "utf8".to_string(),
            allow_duplicates: true,
        };
        let parsed = BTreeInfo::deserialize(Bytes::from(info.serialize())).unwrap();
        assert_eq!(parsed, info);
    }
}
