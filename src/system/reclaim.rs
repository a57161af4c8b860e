//! The page reclaimer.
//!
//! Copy-on-write never frees a page at commit time: superseded pages are
//! listed in the copied-pages tree under the committing revision. Once no
//! live reader can see a revision anymore, the reclaimer walks those
//! entries oldest-first and returns every listed record to the free list,
//! pruning the stale directory entries along the way.
//!
//! The scrubbing happens only after the reclaimer's own header swap, so a
//! crash mid-reclaim leaves at worst unreachable pages that the inspector
//! reports as orphans, never a dangling reference.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info};

use crate::{
    btree::tree::SystemOp,
    database::{free_records, rollback, StoreInner},
    paging::FileHeader,
    system::{copied_pages_tree, directory_tree, CopiedKey, DirectoryKey},
    transaction::write::WriteTransaction,
    types::{Revision, SnapResult, NO_PAGE},
    utils::HandyRwLock,
};

pub(crate) fn reclaim(store: &Arc<StoreInner>) -> SnapResult<usize> {
    let _guard = store.writer.lock();
    if store.reclaiming.swap(true, Ordering::SeqCst) {
        return Ok(0);
    }
    let result = reclaim_inner(store);
    store.reclaiming.store(false, Ordering::SeqCst);
    result
}

fn reclaim_inner(store: &Arc<StoreInner>) -> SnapResult<usize> {
    let (current, nb_trees, old_dir, old_cp, old_prev_dir, old_prev_cp) = {
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

    // Everything at or below the cutoff is invisible: a reader pinned at
    // revision R needs pages superseded after R, never at or before it.
    let cutoff = store.readers.oldest_live_revision().unwrap_or(current);

    let cp = copied_pages_tree(store);
    let consumed: Vec<(CopiedKey, Vec<i64>)> = cp
        .scan_all()?
        .into_iter()
        .filter(|(key, _)| key.revision <= cutoff)
        .collect();

    // Directory entries older than the newest one a reader at the cutoff
    // would use are unreachable; their header records are freed through
    // the copied lists above.
    let dir = directory_tree(store);
    let entries = dir.scan_all()?;
    let mut keep: HashMap<String, Revision> = HashMap::new();
    for (key, _) in &entries {
        if key.revision <= cutoff {
            keep.entry(key.name.clone())
                .and_modify(|r| *r = (*r).max(key.revision))
                .or_insert(key.revision);
        }
    }
    let pruned: Vec<DirectoryKey> = entries
        .iter()
        .filter(|(key, _)| {
            keep.get(&key.name)
                .map(|kept| key.revision < *kept)
                .unwrap_or(false)
        })
        .map(|(key, _)| key.clone())
        .collect();

    if consumed.is_empty() && pruned.is_empty() {
        debug!("nothing to reclaim at cutoff {}", cutoff);
        return Ok(0);
    }

    let mut txn = WriteTransaction::new(current + 1);
    let applied = (|| {
        let dir_applied =
            dir.system_apply(&mut txn, pruned.into_iter().map(SystemOp::Remove).collect())?;
        let cp_applied = cp.system_apply(
            &mut txn,
            consumed
                .iter()
                .map(|(key, _)| SystemOp::Remove(key.clone()))
                .collect(),
        )?;
        Ok((dir_applied, cp_applied))
    })();
    let (dir_applied, cp_applied) = match applied {
        Ok(applied) => applied,
        Err(e) => {
            rollback(store, &txn);
            return Err(e);
        }
    };

    // Reclamation clears the previous slots: after this swap there is
    // nothing to fall back to, and the superseded headers can go.
    let header = FileHeader {
        page_size: store.pager.page_size() as i32,
        nb_trees,
        first_free_page: store.pager.free_head(),
        current_directory: dir_applied.header_offset,
        previous_directory: NO_PAGE,
        current_copied_pages: cp_applied.header_offset,
        previous_copied_pages: NO_PAGE,
    };
    if let Err(e) = store.pager.write_header(&header) {
        rollback(store, &txn);
        return Err(e);
    }

    // -------- linearized: scrub everything now unreachable

    let mut freed = 0usize;
    for (_key, offsets) in &consumed {
        freed += offsets.len();
        free_records(store, offsets);
    }
    free_records(store, &dir_applied.copied);
    free_records(store, &cp_applied.copied);
    for offset in [old_dir, old_prev_dir, old_cp, old_prev_cp] {
        if offset != NO_PAGE {
            free_records(store, &[offset]);
        }
    }

    {
        let mut st = store.state.wl();
        st.revision = txn.revision();
        st.directory_header = dir_applied.header_offset;
        st.previous_directory = NO_PAGE;
        st.copied_header = cp_applied.header_offset;
        st.previous_copied = NO_PAGE;
        st.reclaim_floor = cutoff;
    }

    info!(
        "reclaimed {} record(s) at or below revision {}",
        freed, cutoff
    );
    Ok(freed)
}
