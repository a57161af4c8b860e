//! Structural verification and dumping.
//!
//! The inspector works on the raw page level so it can check any tree,
//! including ones whose key types it cannot decode. Ordering checks use
//! the registered raw comparators and are skipped for unknown serializer
//! ids; every structural invariant (balance, equal leaf depth, revision
//! stamps, page accounting) is checked regardless.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::{
    btree::{
        info::BTreeInfo,
        page::{RawPage, RawValues},
        tree_header::read_tree_header,
    },
    database::Database,
    error::SnapError,
    paging::Pager,
    serializer::{raw_comparator, RawKeyComparator},
    types::{Revision, SnapResult, NO_PAGE},
    utils::HandyRwLock,
};

#[derive(Debug, Clone)]
pub struct TreeReport {
    pub name: String,
    pub revision: Revision,
    pub nb_elems: i64,
    pub depth: usize,
    /// Logical records (pages plus nested value trees and headers).
    pub nb_records: usize,
    /// Physical page slots those records occupy.
    pub nb_pages: usize,
}

#[derive(Debug, Clone)]
pub struct StoreReport {
    pub file_size: i64,
    pub page_size: usize,
    pub revision: Revision,
    pub nb_trees: i32,
    pub trees: Vec<TreeReport>,
    pub free_pages: usize,
    /// Allocated but unreachable page slots; non-zero after an
    /// interrupted commit or reclamation, never referenced by live data.
    pub orphan_pages: usize,
}

/// Verify one user tree's current revision.
pub fn check_tree(db: &Database, name: &str) -> SnapResult<TreeReport> {
    let store = db.store();
    let _guard = store.writer.lock();
    let mut visited = HashSet::new();
    check_tree_locked(db, name, &mut visited)
}

fn check_tree_locked(
    db: &Database,
    name: &str,
    visited: &mut HashSet<i64>,
) -> SnapResult<TreeReport> {
    let store = db.store();
    let header_offset = store
        .state
        .rl()
        .headers
        .get(name)
        .copied()
        .ok_or_else(|| SnapError::BTreeCreation(format!("tree {:?} is not managed", name)))?;
    let header = read_tree_header(&store.pager, header_offset)?;
    let info = BTreeInfo::deserialize(
        store
            .pager
            .read_record(header.info_offset, store.pager.file_size() as usize)?,
    )?;

    let mut walker = TreeWalker {
        pager: &store.pager,
        fanout: info.fanout,
        revision: header.revision,
        comparator: raw_comparator(&info.key_serializer),
        value_comparator: raw_comparator(&info.value_serializer),
        visited,
        leaf_depth: None,
        nb_records: 0,
        nb_pages: 0,
        nb_keys: 0,
    };
    walker.visit_record(header_offset)?;
    walker.visit_record(header.info_offset)?;
    walker.walk(header.root_offset, 0, None, None, true)?;

    if walker.nb_keys != header.nb_elems as u64 {
        return Err(SnapError::InvalidBTree(format!(
            "tree {:?} header claims {} element(s), found {}",
            name, header.nb_elems, walker.nb_keys
        )));
    }

    Ok(TreeReport {
        name: name.to_string(),
        revision: header.revision,
        nb_elems: header.nb_elems,
        depth: walker.leaf_depth.unwrap_or(0),
        nb_records: walker.nb_records,
        nb_pages: walker.nb_pages,
    })
}

/// Verify the whole store: every current tree, the system trees, the
/// free list, and the page accounting.
pub fn check_store(db: &Database) -> SnapResult<StoreReport> {
    let store = db.store();
    let _guard = store.writer.lock();

    let header = store.pager.read_header()?;
    let mut visited: HashSet<i64> = HashSet::new();

    // User trees at their latest revision.
    let names: Vec<String> = {
        let mut names: Vec<String> = store.state.rl().headers.keys().cloned().collect();
        names.sort();
        names
    };
    let mut trees = Vec::with_capacity(names.len());
    for name in &names {
        trees.push(check_tree_locked(db, name, &mut visited)?);
    }

    // System trees.
    let (dir_header_offset, cp_header_offset) = {
        let st = store.state.rl();
        (st.directory_header, st.copied_header)
    };
    let mut pending: Vec<Vec<i64>> = Vec::new();
    for (what, header_offset) in [
        ("directory", dir_header_offset),
        ("copied-pages", cp_header_offset),
    ] {
        let tree_header = read_tree_header(&store.pager, header_offset)?;
        let comparator = if what == "directory" {
            raw_comparator("name-rev")
        } else {
            raw_comparator("rev-name")
        };
        let mut walker = TreeWalker {
            pager: &store.pager,
            fanout: crate::config::DEFAULT_FANOUT,
            revision: tree_header.revision,
            comparator,
            value_comparator: None,
            visited: &mut visited,
            leaf_depth: None,
            nb_records: 0,
            nb_pages: 0,
            nb_keys: 0,
        };
        walker.visit_record(header_offset)?;
        walker.visit_record(tree_header.info_offset)?;
        walker.walk(tree_header.root_offset, 0, None, None, true)?;

        if what == "copied-pages" {
            pending = collect_pending(&store.pager, tree_header.root_offset)?;
        }
    }

    // Header records still parked in the previous slots.
    for offset in [header.previous_directory, header.previous_copied_pages] {
        if offset != NO_PAGE {
            for page in store.pager.chain_offsets(offset)? {
                visited.insert(page);
            }
        }
    }
    // Pages waiting for the reclaimer. Superseded header records of user
    // trees are part of these lists as well.
    for offsets in &pending {
        for &offset in offsets {
            for page in store.pager.chain_offsets(offset)? {
                visited.insert(page);
            }
        }
    }

    // Free list: aligned, acyclic, disjoint from everything reachable.
    let free = store.pager.walk_free_list()?;
    for offset in &free {
        if visited.contains(offset) {
            return Err(SnapError::InvalidBTree(format!(
                "page at {:#x} is both reachable and on the free list",
                offset
            )));
        }
    }

    let page_size = store.pager.page_size();
    let total_pages = (store.pager.file_size() / page_size as i64) as usize;
    let accounted = 1 + visited.len() + free.len(); // header page included
    let orphan_pages = total_pages.saturating_sub(accounted);
    debug!(
        "store check: {} page(s), {} reachable, {} free, {} orphan(s)",
        total_pages,
        visited.len(),
        free.len(),
        orphan_pages
    );

    Ok(StoreReport {
        file_size: store.pager.file_size(),
        page_size,
        revision: db.revision(),
        nb_trees: header.nb_trees,
        trees,
        free_pages: free.len(),
        orphan_pages,
    })
}

/// Offset lists of every copied-pages entry.
fn collect_pending(pager: &Pager, root_offset: i64) -> SnapResult<Vec<Vec<i64>>> {
    let mut out = Vec::new();
    collect_pending_rec(pager, root_offset, &mut out)?;
    Ok(out)
}

fn collect_pending_rec(pager: &Pager, offset: i64, out: &mut Vec<Vec<i64>>) -> SnapResult {
    let bytes = pager.read_record(offset, pager.file_size() as usize)?;
    match RawPage::parse(bytes)? {
        RawPage::Leaf(leaf) => {
            for entry in leaf.entries {
                if let RawValues::Inline { data, .. } = entry.values {
                    let mut r = crate::io::SnapReader::new(data);
                    let nb = r.get_i32()?;
                    let mut offsets = Vec::with_capacity(nb.max(0) as usize);
                    for _ in 0..nb {
                        offsets.push(r.get_i64()?);
                    }
                    out.push(offsets);
                }
            }
            Ok(())
        }
        RawPage::Node(node) => {
            for (first, _) in node.children {
                collect_pending_rec(pager, first, out)?;
            }
            Ok(())
        }
    }
}

/// Human-readable dump of the store structure.
pub fn dump(db: &Database) -> SnapResult<String> {
    let store = db.store();
    let _guard = store.writer.lock();

    let header = store.pager.read_header()?;
    let mut out = String::new();
    let _ = writeln!(out, "file size      : {} bytes", store.pager.file_size());
    let _ = writeln!(out, "page size      : {}", header.page_size);
    let _ = writeln!(out, "managed trees  : {}", header.nb_trees);
    let _ = writeln!(out, "first free page: {:#x}", header.first_free_page);
    let _ = writeln!(
        out,
        "directory      : {:#x} (previous {:#x})",
        header.current_directory, header.previous_directory
    );
    let _ = writeln!(
        out,
        "copied pages   : {:#x} (previous {:#x})",
        header.current_copied_pages, header.previous_copied_pages
    );

    let headers: HashMap<String, i64> = store.state.rl().headers.clone();
    let mut names: Vec<&String> = headers.keys().collect();
    names.sort();
    for name in names {
        let header_offset = headers[name];
        let tree_header = read_tree_header(&store.pager, header_offset)?;
        let _ = writeln!(
            out,
            "tree {:?}: revision {}, {} element(s), root {:#x}",
            name, tree_header.revision, tree_header.nb_elems, tree_header.root_offset
        );
        dump_page(&store.pager, tree_header.root_offset, 1, &mut out)?;
    }
    Ok(out)
}

fn dump_page(pager: &Pager, offset: i64, indent: usize, out: &mut String) -> SnapResult {
    let bytes = pager.read_record(offset, pager.file_size() as usize)?;
    let head = &bytes[..bytes.len().min(48)];
    match RawPage::parse(bytes.clone())? {
        RawPage::Leaf(leaf) => {
            let _ = writeln!(
                out,
                "{:indent$}leaf {:#x} rev {} [{} entries] {}",
                "",
                offset,
                leaf.revision,
                leaf.entries.len(),
                hex::encode(head),
                indent = indent * 2
            );
            Ok(())
        }
        RawPage::Node(node) => {
            let _ = writeln!(
                out,
                "{:indent$}node {:#x} rev {} [{} keys] {}",
                "",
                offset,
                node.revision,
                node.keys.len(),
                hex::encode(head),
                indent = indent * 2
            );
            for (first, _) in node.children {
                dump_page(pager, first, indent + 1, out)?;
            }
            Ok(())
        }
    }
}

// -------------------------------------------------------------- the walk

struct TreeWalker<'a> {
    pager: &'a Pager,
    fanout: usize,
    revision: Revision,
    comparator: Option<Arc<dyn RawKeyComparator>>,
    value_comparator: Option<Arc<dyn RawKeyComparator>>,
    visited: &'a mut HashSet<i64>,
    leaf_depth: Option<usize>,
    nb_records: usize,
    nb_pages: usize,
    nb_keys: u64,
}

impl<'a> TreeWalker<'a> {
    /// Account one record chain, refusing pages referenced twice.
    fn visit_record(&mut self, offset: i64) -> SnapResult {
        for page in self.pager.chain_offsets(offset)? {
            if !self.visited.insert(page) {
                return Err(SnapError::InvalidBTree(format!(
                    "page at {:#x} is referenced twice",
                    page
                )));
            }
            self.nb_pages += 1;
        }
        self.nb_records += 1;
        Ok(())
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> SnapResult<Option<std::cmp::Ordering>> {
        match &self.comparator {
            None => Ok(None),
            Some(cmp) => cmp.compare(a, b).map(Some),
        }
    }

    fn walk(
        &mut self,
        offset: i64,
        depth: usize,
        low: Option<&Bytes>,
        high: Option<&Bytes>,
        is_root: bool,
    ) -> SnapResult {
        self.visit_record(offset)?;
        let bytes = self
            .pager
            .read_record(offset, self.pager.file_size() as usize)?;
        match RawPage::parse(bytes)? {
            RawPage::Leaf(leaf) => {
                if leaf.revision > self.revision {
                    return Err(SnapError::InvalidBTree(format!(
                        "leaf at {:#x} stamped revision {} above tree revision {}",
                        offset, leaf.revision, self.revision
                    )));
                }
                let count = leaf.entries.len();
                self.check_occupancy(offset, count, is_root, false)?;
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(SnapError::InvalidBTree(format!(
                            "leaf at {:#x} sits at depth {}, expected {}",
                            offset, depth, expected
                        )))
                    }
                    Some(_) => {}
                }

                let keys: Vec<&Bytes> = leaf.entries.iter().map(|e| &e.key).collect();
                self.check_key_run(offset, &keys, low, high)?;
                self.nb_keys += count as u64;

                for entry in &leaf.entries {
                    match &entry.values {
                        RawValues::Inline { nb, .. } => {
                            if *nb == 0 {
                                return Err(SnapError::InvalidBTree(format!(
                                    "entry with an empty value set in leaf at {:#x}",
                                    offset
                                )));
                            }
                        }
                        RawValues::SubTree { nb, header_offset } => {
                            self.walk_value_tree(*header_offset, *nb)?;
                        }
                    }
                }
                Ok(())
            }
            RawPage::Node(node) => {
                if node.revision > self.revision {
                    return Err(SnapError::InvalidBTree(format!(
                        "node at {:#x} stamped revision {} above tree revision {}",
                        offset, node.revision, self.revision
                    )));
                }
                let count = node.keys.len();
                self.check_occupancy(offset, count, is_root, true)?;

                let keys: Vec<&Bytes> = node.keys.iter().collect();
                self.check_key_run(offset, &keys, None, high)?;

                for (i, (first, _last)) in node.children.iter().enumerate() {
                    let child_low = if i == 0 {
                        low
                    } else {
                        Some(&node.keys[i - 1])
                    };
                    let child_high = if i < node.keys.len() {
                        Some(&node.keys[i])
                    } else {
                        high
                    };
                    self.walk(*first, depth + 1, child_low, child_high, false)?;
                }
                Ok(())
            }
        }
    }

    fn check_occupancy(
        &self,
        offset: i64,
        count: usize,
        is_root: bool,
        is_node: bool,
    ) -> SnapResult {
        if count > self.fanout {
            return Err(SnapError::InvalidBTree(format!(
                "page at {:#x} holds {} entries, fanout is {}",
                offset, count, self.fanout
            )));
        }
        if is_root {
            if is_node && count == 0 {
                return Err(SnapError::InvalidBTree(format!(
                    "root node at {:#x} has a single child",
                    offset
                )));
            }
            return Ok(());
        }
        if count < self.fanout / 2 {
            return Err(SnapError::InvalidBTree(format!(
                "page at {:#x} holds {} entries, below the minimum {}",
                offset,
                count,
                self.fanout / 2
            )));
        }
        Ok(())
    }

    /// Strict ordering within the page plus the subtree bounds: the
    /// first key must equal the separator above it, every key stays
    /// below the next separator.
    fn check_key_run(
        &self,
        offset: i64,
        keys: &[&Bytes],
        must_equal: Option<&Bytes>,
        below: Option<&Bytes>,
    ) -> SnapResult {
        for pair in keys.windows(2) {
            if let Some(ord) = self.compare(&pair[0][..], &pair[1][..])? {
                if ord != std::cmp::Ordering::Less {
                    return Err(SnapError::InvalidBTree(format!(
                        "keys out of order in page at {:#x}",
                        offset
                    )));
                }
            }
        }
        if let (Some(first), Some(expected)) = (keys.first(), must_equal) {
            if let Some(ord) = self.compare(&first[..], &expected[..])? {
                if ord != std::cmp::Ordering::Equal {
                    return Err(SnapError::InvalidBTree(format!(
                        "separator above page at {:#x} does not equal its first key",
                        offset
                    )));
                }
            }
        }
        if let (Some(last), Some(bound)) = (keys.last(), below) {
            if let Some(ord) = self.compare(&last[..], &bound[..])? {
                if ord != std::cmp::Ordering::Less {
                    return Err(SnapError::InvalidBTree(format!(
                        "key at or above the next separator in page at {:#x}",
                        offset
                    )));
                }
            }
        }
        Ok(())
    }

    fn walk_value_tree(&mut self, header_offset: i64, expected: i64) -> SnapResult {
        self.visit_record(header_offset)?;
        let header = read_tree_header(self.pager, header_offset)?;
        if header.nb_elems != expected {
            return Err(SnapError::InvalidBTree(format!(
                "value tree at {:#x} holds {} value(s), holder claims {}",
                header_offset, header.nb_elems, expected
            )));
        }

        let mut sub = TreeWalker {
            pager: self.pager,
            fanout: self.fanout,
            revision: self.revision,
            comparator: self.value_comparator.clone(),
            value_comparator: None,
            visited: &mut *self.visited,
            leaf_depth: None,
            nb_records: 0,
            nb_pages: 0,
            nb_keys: 0,
        };
        sub.walk(header.root_offset, 0, None, None, true)?;
        if sub.nb_keys != expected as u64 {
            return Err(SnapError::InvalidBTree(format!(
                "value tree at {:#x} contains {} value(s), header claims {}",
                header_offset, sub.nb_keys, expected
            )));
        }
        let (records, pages) = (sub.nb_records, sub.nb_pages);
        drop(sub);
        self.nb_records += records;
        self.nb_pages += pages;
        Ok(())
    }
}
