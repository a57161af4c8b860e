//! The store: one backing file, its system trees, the single writer and
//! the reader registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};

use crate::{
    btree::{
        leaf::BTreeLeaf,
        page::BTreePage,
        tree::{BTree, SystemOp},
        tree_header::{read_tree_header, TreeHeader},
        BTreeInfo, TreeKind,
    },
    config::StoreConfig,
    error::SnapError,
    paging::{FileHeader, Pager},
    serializer::Serializer,
    system::{
        self,
        copied::{copied_pages_info, CopiedKeySerializer, OffsetListSerializer},
        directory::{directory_info, scan_directory, DirectoryKeySerializer},
        CopiedKey, DirectoryKey,
    },
    transaction::{
        lock::WriterLock,
        read::{ReadTransaction, ReaderRegistry},
        reaper::Reaper,
        write::WriteTransaction,
    },
    types::{Revision, SnapResult, NO_PAGE},
    utils::HandyRwLock,
};

use crate::serializer::I64Serializer;

/// Failure injection for the integration tests; compiled out of normal
/// builds.
#[cfg(feature = "testing-api")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    /// Fail the commit after all body pages are on disk but before the
    /// header rewrite.
    BeforeHeaderRewrite,
}

/// In-memory image of the file header plus the derived lookup maps.
pub(crate) struct MasterState {
    pub revision: Revision,
    pub nb_trees: i32,
    /// User tree name to its latest header record offset.
    pub headers: HashMap<String, i64>,
    pub directory_header: i64,
    pub previous_directory: i64,
    pub directory_info: i64,
    pub copied_header: i64,
    pub previous_copied: i64,
    pub copied_info: i64,
    /// Highest revision the reclaimer has already consumed; historical
    /// pins below this are refused.
    pub reclaim_floor: Revision,
}

pub(crate) struct StoreInner {
    pub pager: Arc<Pager>,
    pub config: StoreConfig,
    pub path: PathBuf,
    pub writer: WriterLock,
    pub readers: ReaderRegistry,
    pub state: RwLock<MasterState>,
    pub commits_since_reclaim: AtomicU32,
    pub reclaiming: AtomicBool,
    #[cfg(feature = "testing-api")]
    pub fail_point: Mutex<Option<FailPoint>>,
}

impl StoreInner {
    pub fn next_revision(&self) -> Revision {
        self.state.rl().revision + 1
    }

    #[cfg(feature = "testing-api")]
    pub fn take_fail_point(&self) -> Option<FailPoint> {
        self.fail_point.lock().unwrap().take()
    }
}

/// An open store. Dropping it stops the reaper and flushes the file.
pub struct Database {
    inner: Arc<StoreInner>,
    reaper: Mutex<Option<Reaper>>,
}

impl Database {
    /// Open or create the backing file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> SnapResult<Database> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let (pager, header) = Pager::attach(&path, config.page_size)?;
        let pager = Arc::new(pager);

        let state = match header {
            None => bootstrap(&pager, config.page_size)?,
            Some(header) => load(&pager, header)?,
        };

        info!(
            "store {:?} open at revision {}, {} user tree(s)",
            path,
            state.revision,
            state.headers.len()
        );

        let inner = Arc::new(StoreInner {
            pager,
            config,
            path,
            writer: WriterLock::new(),
            readers: ReaderRegistry::new(),
            state: RwLock::new(state),
            commits_since_reclaim: AtomicU32::new(0),
            reclaiming: AtomicBool::new(false),
            #[cfg(feature = "testing-api")]
            fail_point: Mutex::new(None),
        });

        let reaper = Reaper::spawn(Arc::clone(&inner))?;
        Ok(Database {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub(crate) fn store(&self) -> &Arc<StoreInner> {
        &self.inner
    }

    /// Create a new named tree. The name must be fresh; reserved names
    /// (leading dot) belong to the system trees.
    pub fn manage<K, V>(
        &self,
        name: &str,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        fanout: usize,
        allow_duplicates: bool,
    ) -> SnapResult<BTree<K, V>>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        if name.starts_with('.') {
            return Err(SnapError::BTreeCreation(format!(
                "tree names starting with '.' are reserved, got {:?}",
                name
            )));
        }
        if fanout < 2 {
            return Err(SnapError::BTreeCreation(format!(
                "fanout must be at least 2, got {}",
                fanout
            )));
        }

        let _guard = self.inner.writer.lock();
        if self.inner.state.rl().headers.contains_key(name) {
            return Err(SnapError::BTreeAlreadyManaged(name.to_string()));
        }

        let mut txn = WriteTransaction::new(self.inner.next_revision());
        let info = BTreeInfo {
            fanout,
            name: name.to_string(),
            key_serializer: key_ser.id().to_string(),
            value_serializer: val_ser.id().to_string(),
            allow_duplicates,
        };

        let created = (|| -> SnapResult<i64> {
            let (info_offset, _) = txn.write_record(&self.inner.pager, &info.serialize())?;
            let root = BTreePage::<K, V>::Leaf(BTreeLeaf::new_empty(
                txn.next_page_id(),
                txn.revision(),
            ));
            let payload = root.serialize(key_ser.as_ref(), val_ser.as_ref())?;
            let (root_offset, _) = txn.write_record(&self.inner.pager, &payload)?;
            let header = TreeHeader {
                revision: txn.revision(),
                nb_elems: 0,
                root_offset,
                info_offset,
            };
            let (header_offset, _) = txn.write_record(&self.inner.pager, &header.serialize())?;
            txn.add_tree_update(crate::transaction::write::TreeUpdate {
                name: name.to_string(),
                kind: TreeKind::User,
                header_offset,
                nb_elems: 0,
                copied: Vec::new(),
                new_tree: true,
            });
            Ok(info_offset)
        })();

        match created {
            Ok(info_offset) => {
                commit(&self.inner, txn)?;
                info!("tree {:?} managed (fanout {})", name, fanout);
                Ok(BTree::facade(
                    Arc::clone(&self.inner),
                    TreeKind::User,
                    info,
                    info_offset,
                    key_ser,
                    val_ser,
                ))
            }
            Err(e) => {
                rollback(&self.inner, &txn);
                Err(e)
            }
        }
    }

    /// Open an existing tree, checking the serializer ids against the
    /// ones the tree was created with.
    pub fn tree<K, V>(
        &self,
        name: &str,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
    ) -> SnapResult<BTree<K, V>>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let header_offset = self
            .inner
            .state
            .rl()
            .headers
            .get(name)
            .copied()
            .ok_or_else(|| SnapError::BTreeCreation(format!("tree {:?} is not managed", name)))?;
        let header = read_tree_header(&self.inner.pager, header_offset)?;
        let info = BTreeInfo::deserialize(
            self.inner
                .pager
                .read_record(header.info_offset, self.inner.pager.file_size() as usize)?,
        )?;

        if info.key_serializer != key_ser.id() || info.value_serializer != val_ser.id() {
            return Err(SnapError::BTreeCreation(format!(
                "tree {:?} was created with serializers ({}, {}), asked for ({}, {})",
                name,
                info.key_serializer,
                info.value_serializer,
                key_ser.id(),
                val_ser.id()
            )));
        }

        Ok(BTree::facade(
            Arc::clone(&self.inner),
            TreeKind::User,
            info,
            header.info_offset,
            key_ser,
            val_ser,
        ))
    }

    /// Build a fresh dense tree from a tuple stream. See the bulk module
    /// for the sort/merge pipeline.
    pub fn bulk_load<K, V, I>(
        &self,
        name: &str,
        key_ser: Arc<dyn Serializer<K>>,
        val_ser: Arc<dyn Serializer<V>>,
        fanout: usize,
        allow_duplicates: bool,
        tuples: I,
    ) -> SnapResult<BTree<K, V>>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        I: IntoIterator<Item = (K, V)>,
    {
        if name.starts_with('.') {
            return Err(SnapError::BTreeCreation(format!(
                "tree names starting with '.' are reserved, got {:?}",
                name
            )));
        }
        if fanout < 2 {
            return Err(SnapError::BTreeCreation(format!(
                "fanout must be at least 2, got {}",
                fanout
            )));
        }

        let _guard = self.inner.writer.lock();
        if self.inner.state.rl().headers.contains_key(name) {
            return Err(SnapError::BTreeAlreadyManaged(name.to_string()));
        }

        let mut txn = WriteTransaction::new(self.inner.next_revision());
        let loaded = crate::bulk::load_tree(
            &self.inner,
            &mut txn,
            name,
            key_ser.as_ref(),
            val_ser.as_ref(),
            fanout,
            allow_duplicates,
            tuples.into_iter(),
        );

        match loaded {
            Ok((info, info_offset)) => {
                commit(&self.inner, txn)?;
                info!("tree {:?} bulk loaded", name);
                Ok(BTree::facade(
                    Arc::clone(&self.inner),
                    TreeKind::User,
                    info,
                    info_offset,
                    key_ser,
                    val_ser,
                ))
            }
            Err(e) => {
                rollback(&self.inner, &txn);
                Err(e)
            }
        }
    }

    pub fn tree_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.rl().headers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_tree(&self, name: &str) -> bool {
        self.inner.state.rl().headers.contains_key(name)
    }

    /// Current committed revision.
    pub fn revision(&self) -> Revision {
        self.inner.state.rl().revision
    }

    pub fn nb_trees(&self) -> i32 {
        self.inner.state.rl().nb_trees
    }

    /// Pin a snapshot usable across several trees.
    pub fn begin_read(&self) -> ReadTransaction {
        ReadTransaction::begin(&self.inner)
    }

    pub fn live_readers(&self) -> usize {
        self.inner.readers.live_count()
    }

    /// Run the page reclaimer immediately instead of waiting for the
    /// commit-count trigger. Returns the number of records freed.
    pub fn reclaim_now(&self) -> SnapResult<usize> {
        system::reclaim(&self.inner)
    }

    pub fn file_size(&self) -> i64 {
        self.inner.pager.file_size()
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn sync(&self) -> SnapResult {
        self.inner.pager.sync()
    }

    #[cfg(feature = "testing-api")]
    pub fn set_fail_point(&self, fail_point: FailPoint) {
        *self.inner.fail_point.lock().unwrap() = Some(fail_point);
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(mut reaper) = self.reaper.lock().unwrap().take() {
            reaper.stop();
        }
        if let Err(e) = self.inner.pager.sync() {
            warn!("could not sync on close: {}", e);
        }
    }
}

// -------------------------------------------------------------- lifecycle

/// First open of an empty file: install the two system trees and write
/// the initial header.
fn bootstrap(pager: &Arc<Pager>, page_size: usize) -> SnapResult<MasterState> {
    let mut page_id = 0i64;
    let mut next_id = || {
        page_id += 1;
        page_id
    };

    // Tree directory.
    let dir_info = directory_info();
    let (dir_info_offset, _) = pager.write_record(&dir_info.serialize())?;
    let dir_root = BTreePage::<DirectoryKey, i64>::Leaf(BTreeLeaf::new_empty(next_id(), 0));
    let payload = dir_root.serialize(&DirectoryKeySerializer, &I64Serializer)?;
    let (dir_root_offset, _) = pager.write_record(&payload)?;
    let dir_header = TreeHeader {
        revision: 0,
        nb_elems: 0,
        root_offset: dir_root_offset,
        info_offset: dir_info_offset,
    };
    let (dir_header_offset, _) = pager.write_record(&dir_header.serialize())?;

    // Copied-pages tree.
    let cp_info = copied_pages_info();
    let (cp_info_offset, _) = pager.write_record(&cp_info.serialize())?;
    let cp_root = BTreePage::<CopiedKey, Vec<i64>>::Leaf(BTreeLeaf::new_empty(next_id(), 0));
    let payload = cp_root.serialize(&CopiedKeySerializer, &OffsetListSerializer)?;
    let (cp_root_offset, _) = pager.write_record(&payload)?;
    let cp_header = TreeHeader {
        revision: 0,
        nb_elems: 0,
        root_offset: cp_root_offset,
        info_offset: cp_info_offset,
    };
    let (cp_header_offset, _) = pager.write_record(&cp_header.serialize())?;

    let mut header = FileHeader::new(page_size);
    header.nb_trees = 2;
    header.first_free_page = pager.free_head();
    header.current_directory = dir_header_offset;
    header.current_copied_pages = cp_header_offset;
    pager.write_header(&header)?;

    debug!("bootstrapped fresh store, system trees installed");

    Ok(MasterState {
        revision: 0,
        nb_trees: 2,
        headers: HashMap::new(),
        directory_header: dir_header_offset,
        previous_directory: NO_PAGE,
        directory_info: dir_info_offset,
        copied_header: cp_header_offset,
        previous_copied: NO_PAGE,
        copied_info: cp_info_offset,
        reclaim_floor: 0,
    })
}

/// Open an existing file: validate the free list, pick the live header
/// pair (falling back to the previous slots on damage) and rebuild the
/// name map from the directory.
fn load(pager: &Arc<Pager>, header: FileHeader) -> SnapResult<MasterState> {
    pager.walk_free_list()?;

    let (dir_header_offset, dir_header) = pick_header_slot(
        pager,
        header.current_directory,
        header.previous_directory,
        "directory",
    )?;
    let (cp_header_offset, cp_header) = pick_header_slot(
        pager,
        header.current_copied_pages,
        header.previous_copied_pages,
        "copied-pages",
    )?;

    let revision = dir_header.revision.max(cp_header.revision);

    let mut headers: HashMap<String, i64> = HashMap::new();
    let mut best: HashMap<String, Revision> = HashMap::new();
    for (key, offset) in scan_directory(pager, dir_header.root_offset)? {
        let newer = best
            .get(&key.name)
            .map(|known| key.revision > *known)
            .unwrap_or(true);
        if newer {
            best.insert(key.name.clone(), key.revision);
            headers.insert(key.name, offset);
        }
    }

    debug!(
        "loaded store at revision {}: {} user tree(s)",
        revision,
        headers.len()
    );

    Ok(MasterState {
        revision,
        nb_trees: header.nb_trees,
        headers,
        directory_header: dir_header_offset,
        previous_directory: header.previous_directory,
        directory_info: dir_header.info_offset,
        copied_header: cp_header_offset,
        previous_copied: header.previous_copied_pages,
        copied_info: cp_header.info_offset,
        reclaim_floor: 0,
    })
}

fn pick_header_slot(
    pager: &Arc<Pager>,
    current: i64,
    previous: i64,
    what: &str,
) -> SnapResult<(i64, TreeHeader)> {
    match read_tree_header(pager, current) {
        Ok(header) => Ok((current, header)),
        Err(current_err) => {
            if previous == NO_PAGE {
                return Err(current_err);
            }
            warn!(
                "current {} header at {:#x} unreadable ({}), falling back to previous",
                what, current, current_err
            );
            let header = read_tree_header(pager, previous)?;
            Ok((previous, header))
        }
    }
}

// ----------------------------------------------------------------- commit

/// Publish a write transaction: append the directory entries, record the
/// superseded pages, then swap the header. The header rewrite is the
/// linearization point; any earlier failure rolls the transaction back
/// and leaves the committed state untouched.
pub(crate) fn commit(store: &Arc<StoreInner>, txn: WriteTransaction) -> SnapResult {
    let mut txn = txn;
    match commit_inner(store, &mut txn) {
        Ok(()) => Ok(()),
        Err(e) => {
            rollback(store, &txn);
            Err(e)
        }
    }
}

fn commit_inner(store: &Arc<StoreInner>, txn: &mut WriteTransaction) -> SnapResult {
    let (old_revision, nb_trees, old_dir, old_cp, old_prev_dir, old_prev_cp) = {
        let st = store.state.rl();
        (
            st.revision,
            st.nb_trees,
            st.directory_header,
            st.copied_header,
            st.previous_directory,
            st.previous_copied,
        )
    };
    debug_assert_eq!(txn.revision(), old_revision + 1);

    // Directory entries go in after the user pages so the directory only
    // ever points at complete trees.
    let dir_ops: Vec<SystemOp<DirectoryKey, i64>> = txn
        .tree_updates()
        .iter()
        .map(|tu| {
            SystemOp::Put(
                DirectoryKey {
                    name: tu.name.clone(),
                    revision: txn.revision(),
                },
                tu.header_offset,
            )
        })
        .collect();
    let new_trees = txn.tree_updates().iter().filter(|tu| tu.new_tree).count() as i32;

    let dir = system::directory_tree(store);
    let dir_applied = dir.system_apply(txn, dir_ops)?;

    // Superseded user pages are recorded for the reclaimer.
    let cp_ops: Vec<SystemOp<CopiedKey, Vec<i64>>> = txn
        .tree_updates()
        .iter()
        .filter(|tu| !tu.copied.is_empty())
        .map(|tu| {
            SystemOp::Put(
                CopiedKey {
                    revision: txn.revision(),
                    name: tu.name.clone(),
                },
                tu.copied.clone(),
            )
        })
        .collect();
    let cp_applied = if cp_ops.is_empty() {
        None
    } else {
        let cp = system::copied_pages_tree(store);
        Some(cp.system_apply(txn, cp_ops)?)
    };

    #[cfg(feature = "testing-api")]
    if store.take_fail_point() == Some(FailPoint::BeforeHeaderRewrite) {
        return Err(SnapError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "injected failure before header rewrite",
        )));
    }

    let new_dir = dir_applied.header_offset;
    let new_cp = cp_applied
        .as_ref()
        .map(|applied| applied.header_offset)
        .unwrap_or(old_cp);

    let header = FileHeader {
        page_size: store.pager.page_size() as i32,
        nb_trees: nb_trees + new_trees,
        first_free_page: store.pager.free_head(),
        current_directory: new_dir,
        previous_directory: old_dir,
        current_copied_pages: new_cp,
        previous_copied_pages: if cp_applied.is_some() {
            old_cp
        } else {
            old_prev_cp
        },
    };
    store.pager.write_header(&header)?;

    // -------- linearized: everything below is cleanup, never failure

    // System pages superseded by this commit are freed directly; they
    // are never routed through the copied-pages tree.
    free_records(store, &dir_applied.copied);
    if let Some(applied) = &cp_applied {
        free_records(store, &applied.copied);
    }
    // Header records that just fell out of the previous slots.
    if old_prev_dir != NO_PAGE {
        free_records(store, &[old_prev_dir]);
    }
    if cp_applied.is_some() && old_prev_cp != NO_PAGE {
        free_records(store, &[old_prev_cp]);
    }

    {
        let mut st = store.state.wl();
        st.revision = txn.revision();
        st.nb_trees = header.nb_trees;
        st.directory_header = new_dir;
        st.previous_directory = old_dir;
        if cp_applied.is_some() {
            st.previous_copied = old_cp;
            st.copied_header = new_cp;
        }
        for tu in txn.tree_updates() {
            st.headers.insert(tu.name.clone(), tu.header_offset);
        }
    }

    info!(
        "committed revision {} ({} tree(s) updated)",
        txn.revision(),
        txn.tree_updates().len()
    );

    // Reclamation policy: every N commits, skipping reentry from the
    // reclaimer's own commit.
    let commits = store.commits_since_reclaim.fetch_add(1, Ordering::SeqCst) + 1;
    if commits >= store.config.reclaim_commit_threshold
        && !store.reclaiming.load(Ordering::SeqCst)
    {
        store.commits_since_reclaim.store(0, Ordering::SeqCst);
        if let Err(e) = system::reclaim(store) {
            warn!("page reclamation failed: {}", e);
        }
    }

    Ok(())
}

pub(crate) fn free_records(store: &Arc<StoreInner>, offsets: &[i64]) {
    for &offset in offsets {
        if let Err(e) = store.pager.free_record(offset) {
            warn!("could not free record at {:#x}: {}", offset, e);
        }
    }
}

/// Return every page the transaction allocated to the free list. The
/// on-disk header was never rewritten, so the committed state is intact.
pub(crate) fn rollback(store: &Arc<StoreInner>, txn: &WriteTransaction) {
    debug!(
        "rolling back transaction for revision {} ({} record(s))",
        txn.revision(),
        txn.allocated().len()
    );
    free_records(store, txn.allocated());
}
