use bytes::Bytes;

use crate::{
    error::SnapError,
    io::{SnapReader, SnapWriter},
    types::{SnapResult, NO_PAGE},
};

/// Page 0 of the backing file.
///
/// The current/previous pairs form a two-slot cell: a commit first writes
/// everything it references, then rewrites this page with the new current
/// offsets while the old ones move to the previous slots. Reclamation
/// clears the previous slots once nothing can roll back to them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: i32,
    pub nb_trees: i32,
    pub first_free_page: i64,
    pub current_directory: i64,
    pub previous_directory: i64,
    pub current_copied_pages: i64,
    pub previous_copied_pages: i64,
}

impl FileHeader {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as i32,
            nb_trees: 0,
            first_free_page: NO_PAGE,
            current_directory: NO_PAGE,
            previous_directory: NO_PAGE,
            current_copied_pages: NO_PAGE,
            previous_copied_pages: NO_PAGE,
        }
    }

    /// Full header page, zero-padded to `page_size`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = SnapWriter::with_capacity(self.page_size as usize);
        w.put_i32(self.page_size);
        w.put_i32(self.nb_trees);
        w.put_i64(self.first_free_page);
        w.put_i64(self.current_directory);
        w.put_i64(self.previous_directory);
        w.put_i64(self.current_copied_pages);
        w.put_i64(self.previous_copied_pages);
        let mut buf = w.freeze().to_vec();
        buf.resize(self.page_size as usize, 0);
        buf
    }

    pub fn deserialize(bytes: Bytes) -> SnapResult<Self> {
        let mut r = SnapReader::new(bytes);
        let page_size = r.get_i32()?;
        if page_size <= 0 || !(page_size as u32).is_power_of_two() {
            return Err(SnapError::InvalidBTree(format!(
                "not a database file: page size {}",
                page_size
            )));
        }
        let nb_trees = r.get_i32()?;
        let header = Self {
            page_size,
            nb_trees,
            first_free_page: r.get_i64()?,
            current_directory: r.get_i64()?,
            previous_directory: r.get_i64()?,
            current_copied_pages: r.get_i64()?,
            previous_copied_pages: r.get_i64()?,
        };
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut h = FileHeader::new(512);
        h.nb_trees = 3;
        h.first_free_page = 1024;
        h.current_directory = 512;
        h.previous_directory = NO_PAGE;
        h.current_copied_pages = 2048;
        h.previous_copied_pages = 1536;

        let bytes = h.serialize();
        assert_eq!(bytes.len(), 512);
        let parsed = FileHeader::deserialize(Bytes::from(bytes)).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_rejects_zeroed_page() {
        let res = FileHeader::deserialize(Bytes::from(vec![0u8; 512]));
        assert!(res.is_err());
    }
}
