//! The record manager.
//!
//! The backing file is a pool of equal-size pages. A record is one page
//! or a chain of pages linked through their next-page pointers; the first
//! page of a record carries the payload size. Freed pages are threaded
//! into a singly linked free list whose head lives in the file header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;

use crate::{
    error::SnapError,
    paging::{FileHeader, PageIO},
    types::{SnapResult, NO_PAGE},
};

pub struct Pager {
    file: Mutex<File>,

    page_size: usize,

    /// Head of the free page list. Persisted in the file header on the
    /// next commit; until then the on-disk header trails this value.
    free_head: Mutex<i64>,

    /// End of the allocated region; the next file extension starts here.
    end: AtomicI64,
}

impl Pager {
    /// Open or create the backing file.
    ///
    /// Returns the parsed header for an existing file, `None` for a fresh
    /// one (the caller bootstraps the system trees, then writes the first
    /// header).
    pub(crate) fn attach(path: &Path, page_size: usize) -> SnapResult<(Self, Option<FileHeader>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len() as i64;

        if len == 0 {
            debug!("creating database file {:?}, page size {}", path, page_size);
            let pager = Self {
                file: Mutex::new(file),
                page_size,
                free_head: Mutex::new(NO_PAGE),
                end: AtomicI64::new(page_size as i64),
            };
            return Ok((pager, None));
        }

        if len < 48 {
            return Err(SnapError::InvalidBTree(format!(
                "file too short to hold a header: {} bytes",
                len
            )));
        }

        let mut buf = vec![0u8; 48];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let header = FileHeader::deserialize(Bytes::from(buf))?;

        if header.page_size as usize != page_size {
            return Err(SnapError::BTreeCreation(format!(
                "file has page size {}, asked to open with {}",
                header.page_size, page_size
            )));
        }

        // A torn extension can leave a partial page at the tail; it was
        // never referenced, so it is simply ignored.
        let end = len - len % page_size as i64;

        debug!(
            "opened database file {:?}: {} pages, {} trees",
            path,
            end / page_size as i64,
            header.nb_trees
        );

        let pager = Self {
            file: Mutex::new(file),
            page_size,
            free_head: Mutex::new(header.first_free_page),
            end: AtomicI64::new(end),
        };
        Ok((pager, Some(header)))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Size of the allocated region in bytes.
    pub fn file_size(&self) -> i64 {
        self.end.load(Ordering::SeqCst)
    }

    pub(crate) fn free_head(&self) -> i64 {
        *self.free_head.lock().unwrap()
    }

    /// Rejects offsets that cannot possibly name a data page. Misaligned
    /// or negative offsets are `InvalidOffset`; offsets past the end of
    /// the file are `EndOfFile`.
    fn validate_data_offset(&self, offset: i64) -> SnapResult {
        let ps = self.page_size as i64;
        if offset < ps || offset % ps != 0 {
            return Err(SnapError::InvalidOffset(
                offset,
                "not a page-aligned data offset".to_string(),
            ));
        }
        if offset + ps > self.file_size() {
            return Err(SnapError::EndOfFile(format!(
                "page at {:#x} lies past the end of the file ({:#x})",
                offset,
                self.file_size()
            )));
        }
        Ok(())
    }

    fn read_page_at(&self, file: &mut File, offset: i64) -> SnapResult<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&self, file: &mut File, offset: i64, bytes: &[u8]) -> SnapResult {
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    // ------------------------------------------------------------ header

    pub fn read_header(&self) -> SnapResult<FileHeader> {
        let mut file = self.file.lock().unwrap();
        let mut buf = vec![0u8; 48];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        FileHeader::deserialize(Bytes::from(buf))
    }

    /// Rewrite page 0. This is the commit linearization point: everything
    /// the new header references must already be on disk, so the body
    /// pages are flushed to the platter first.
    pub(crate) fn write_header(&self, header: &FileHeader) -> SnapResult {
        let bytes = header.serialize();
        let mut file = self.file.lock().unwrap();
        file.sync_data()?;
        self.write_at(&mut file, 0, &bytes)?;
        file.sync_data()?;
        debug!(
            "header rewritten: directory {:#x}/{:#x}, copied {:#x}/{:#x}, free {:#x}",
            header.current_directory,
            header.previous_directory,
            header.current_copied_pages,
            header.previous_copied_pages,
            header.first_free_page
        );
        Ok(())
    }

    // ----------------------------------------------------------- records

    /// Read a whole record starting at `offset`, following the page chain.
    /// `max_bytes` bounds the believable payload size; a stored size above
    /// it means the offset does not point at a record of the expected kind.
    pub fn read_record(&self, offset: i64, max_bytes: usize) -> SnapResult<Bytes> {
        self.validate_data_offset(offset)?;

        let max_pages = (self.file_size() / self.page_size as i64) as usize;
        let mut file = self.file.lock().unwrap();

        let page = self.read_page_at(&mut file, offset)?;
        let mut slice = &page[..];
        let mut next = slice.get_i64();
        let size = slice.get_i32();

        if size < 0 || size as usize > max_bytes {
            return Err(SnapError::InvalidBTree(format!(
                "record at {:#x} claims {} payload bytes, limit {}",
                offset, size, max_bytes
            )));
        }

        let size = size as usize;
        let mut out = BytesMut::with_capacity(size);
        let take = size.min(PageIO::first_capacity(self.page_size));
        out.put_slice(&slice[..take]);
        let mut remaining = size - take;
        let mut hops = 1usize;

        while remaining > 0 {
            if next == NO_PAGE {
                return Err(SnapError::EndOfFile(format!(
                    "record at {:#x} truncated, {} bytes missing",
                    offset, remaining
                )));
            }
            self.validate_data_offset(next)?;
            hops += 1;
            if hops > max_pages {
                return Err(SnapError::InvalidBTree(format!(
                    "cycle in record chain starting at {:#x}",
                    offset
                )));
            }

            let page = self.read_page_at(&mut file, next)?;
            let mut slice = &page[..];
            next = slice.get_i64();
            let take = remaining.min(PageIO::continuation_capacity(self.page_size));
            out.put_slice(&slice[..take]);
            remaining -= take;
        }

        Ok(out.freeze())
    }

    /// Offsets of every page of the record chain starting at `offset`.
    pub(crate) fn chain_offsets(&self, offset: i64) -> SnapResult<Vec<i64>> {
        self.validate_data_offset(offset)?;

        let max_pages = (self.file_size() / self.page_size as i64) as usize;
        let mut file = self.file.lock().unwrap();
        let mut offsets = Vec::new();
        let mut cursor = offset;

        while cursor != NO_PAGE {
            self.validate_data_offset(cursor)?;
            offsets.push(cursor);
            if offsets.len() > max_pages {
                return Err(SnapError::InvalidBTree(format!(
                    "cycle in record chain starting at {:#x}",
                    offset
                )));
            }
            let mut buf = [0u8; 8];
            file.seek(SeekFrom::Start(cursor as u64))?;
            file.read_exact(&mut buf)?;
            cursor = i64::from_be_bytes(buf);
        }

        Ok(offsets)
    }

    /// Build a chain able to hold `nb_bytes` of payload, reusing free
    /// pages first and extending the file for the remainder.
    pub(crate) fn allocate(&self, nb_bytes: usize) -> SnapResult<Vec<PageIO>> {
        let nb_pages = PageIO::chain_length(self.page_size, nb_bytes);
        let mut offsets = Vec::with_capacity(nb_pages);

        {
            let mut head = self.free_head.lock().unwrap();
            let mut file = self.file.lock().unwrap();
            while offsets.len() < nb_pages && *head != NO_PAGE {
                let off = *head;
                self.validate_data_offset(off)
                    .map_err(|e| SnapError::InvalidBTree(format!("free list corrupt: {}", e)))?;
                let mut buf = [0u8; 8];
                file.seek(SeekFrom::Start(off as u64))?;
                file.read_exact(&mut buf)?;
                *head = i64::from_be_bytes(buf);
                offsets.push(off);
            }
        }

        while offsets.len() < nb_pages {
            offsets.push(self.end.fetch_add(self.page_size as i64, Ordering::SeqCst));
        }

        let mut chain: Vec<PageIO> = offsets.iter().map(|&off| PageIO::new(off)).collect();
        for i in 0..chain.len() - 1 {
            let next = chain[i + 1].offset();
            chain[i].set_next(next);
        }

        debug!(
            "allocated {} page(s) for {} bytes, first {:#x}",
            chain.len(),
            nb_bytes,
            chain[0].offset()
        );
        Ok(chain)
    }

    /// Write `payload` into `chain`. Full pages are always written, so a
    /// page recycled from the free list never leaks stale bytes, and
    /// rewriting the same chain is idempotent.
    pub(crate) fn flush_record(&self, chain: &[PageIO], payload: &[u8]) -> SnapResult {
        let mut file = self.file.lock().unwrap();
        let mut pos = 0usize;

        for (i, page) in chain.iter().enumerate() {
            let mut buf = BytesMut::with_capacity(self.page_size);
            buf.put_i64(page.next());
            let capacity = if i == 0 {
                buf.put_i32(payload.len() as i32);
                PageIO::first_capacity(self.page_size)
            } else {
                PageIO::continuation_capacity(self.page_size)
            };
            let take = capacity.min(payload.len() - pos);
            buf.put_slice(&payload[pos..pos + take]);
            pos += take;
            buf.resize(self.page_size, 0);
            self.write_at(&mut file, page.offset(), &buf)?;
        }

        Ok(())
    }

    /// Allocate and flush in one step; returns the first and last page
    /// offsets of the new record.
    pub(crate) fn write_record(&self, payload: &[u8]) -> SnapResult<(i64, i64)> {
        let chain = self.allocate(payload.len())?;
        match self.flush_record(&chain, payload) {
            Ok(()) => Ok((
                chain[0].offset(),
                chain[chain.len() - 1].offset(),
            )),
            Err(e) => {
                // Hand the pages back; losing them would only leak until
                // the next reopen, but there is no reason to wait.
                if let Err(free_err) = self.free_pages(&chain) {
                    log::warn!("could not return pages after failed flush: {}", free_err);
                }
                Err(e)
            }
        }
    }

    /// Return the record chain starting at `offset` to the free list.
    /// One walk to find the tail, then a single link write.
    pub(crate) fn free_record(&self, offset: i64) -> SnapResult<usize> {
        let offsets = self.chain_offsets(offset)?;
        let last = offsets[offsets.len() - 1];

        let mut head = self.free_head.lock().unwrap();
        let mut file = self.file.lock().unwrap();
        self.write_at(&mut file, last, &head.to_be_bytes())?;
        *head = offset;

        debug!("freed record at {:#x} ({} pages)", offset, offsets.len());
        Ok(offsets.len())
    }

    /// Return an in-memory chain to the free list, rewriting every next
    /// pointer (the chain may never have reached the disk).
    pub(crate) fn free_pages(&self, chain: &[PageIO]) -> SnapResult {
        if chain.is_empty() {
            return Ok(());
        }
        let mut head = self.free_head.lock().unwrap();
        let mut file = self.file.lock().unwrap();
        for i in 0..chain.len() {
            let next = if i + 1 < chain.len() {
                chain[i + 1].offset()
            } else {
                *head
            };
            self.write_at(&mut file, chain[i].offset(), &next.to_be_bytes())?;
        }
        *head = chain[0].offset();
        Ok(())
    }

    /// Walk the whole free list, checking alignment and acyclicity.
    pub fn walk_free_list(&self) -> SnapResult<Vec<i64>> {
        let head = self.free_head.lock().unwrap();
        let mut file = self.file.lock().unwrap();

        let mut seen = std::collections::HashSet::new();
        let mut offsets = Vec::new();
        let mut cursor = *head;

        while cursor != NO_PAGE {
            self.validate_data_offset(cursor)
                .map_err(|e| SnapError::InvalidBTree(format!("free list corrupt: {}", e)))?;
            if !seen.insert(cursor) {
                return Err(SnapError::InvalidBTree(format!(
                    "cycle in free list at {:#x}",
                    cursor
                )));
            }
            offsets.push(cursor);
            let mut buf = [0u8; 8];
            file.seek(SeekFrom::Start(cursor as u64))?;
            file.read_exact(&mut buf)?;
            cursor = i64::from_be_bytes(buf);
        }

        Ok(offsets)
    }

    pub fn sync(&self) -> SnapResult {
        self.file.lock().unwrap().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, Pager) {
        let dir = TempDir::new().unwrap();
        let (pager, header) = Pager::attach(&dir.path().join("t.db"), 512).unwrap();
        assert!(header.is_none());
        (dir, pager)
    }

    #[test]
    fn test_single_page_record_round_trip() {
        let (_dir, pager) = scratch();
        let payload = vec![7u8; 100];
        let (first, last) = pager.write_record(&payload).unwrap();
        assert_eq!(first, last);
        assert_eq!(pager.read_record(first, 4096).unwrap().as_ref(), &payload[..]);
    }

    #[test]
    fn test_chained_record_round_trip() {
        let (_dir, pager) = scratch();
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let (first, last) = pager.write_record(&payload).unwrap();
        assert_ne!(first, last);
        assert_eq!(pager.read_record(first, 4096).unwrap().as_ref(), &payload[..]);
        assert_eq!(pager.chain_offsets(first).unwrap().len(), 4);
    }

    #[test]
    fn test_free_then_reuse() {
        let (_dir, pager) = scratch();
        let (first, _) = pager.write_record(&[1u8; 100]).unwrap();
        let end_before = pager.file_size();
        pager.free_record(first).unwrap();
        assert_eq!(pager.walk_free_list().unwrap(), vec![first]);

        // The next allocation reuses the freed page instead of growing
        // the file.
        let (again, _) = pager.write_record(&[2u8; 100]).unwrap();
        assert_eq!(again, first);
        assert_eq!(pager.file_size(), end_before);
        assert!(pager.walk_free_list().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_misaligned_offset() {
        let (_dir, pager) = scratch();
        pager.write_record(&[0u8; 10]).unwrap();
        match pager.read_record(513, 4096) {
            Err(SnapError::InvalidOffset(_, _)) => {}
            other => panic!("expected InvalidOffset, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_rejects_offset_past_eof() {
        let (_dir, pager) = scratch();
        match pager.read_record(1 << 20, 4096) {
            Err(SnapError::EndOfFile(_)) => {}
            other => panic!("expected EndOfFile, got {:?}", other.map(|b| b.len())),
        }
    }
}
