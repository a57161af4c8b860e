//! The bulk loader.
//!
//! Builds a fresh, maximally dense tree from a tuple stream in four
//! phases: chunked in-memory sort (spilling sorted runs to temp files
//! when the input outgrows one chunk), a k-way merge of the runs, level
//! planning from the exact key count, and a bottom-up fill that writes
//! every page exactly once. No splits ever happen; the resulting height
//! is the theoretical minimum.

mod build;
mod merge;
mod sort;

use std::sync::Arc;

use log::info;

use crate::{
    btree::{info::BTreeInfo, tree_header::TreeHeader, wal::TreeCtx, TreeKind},
    database::StoreInner,
    serializer::Serializer,
    transaction::write::{TreeUpdate, WriteTransaction},
    types::SnapResult,
};

pub(crate) use build::build_dense;

/// Sort, merge and build one new tree inside the caller's transaction.
/// The caller holds the writer lock and commits afterwards.
#[allow(clippy::too_many_arguments)]
pub(crate) fn load_tree<K, V>(
    store: &Arc<StoreInner>,
    txn: &mut WriteTransaction,
    name: &str,
    key_ser: &dyn Serializer<K>,
    val_ser: &dyn Serializer<V>,
    fanout: usize,
    allow_duplicates: bool,
    tuples: impl Iterator<Item = (K, V)>,
) -> SnapResult<(BTreeInfo, i64)>
where
    K: Clone,
    V: Clone,
{
    let ctx = TreeCtx {
        pager: &store.pager,
        key_ser,
        val_ser,
        fanout,
        allow_duplicates,
        inline_threshold: store.config.value_inline_threshold,
    };

    let output = sort::sort_into_runs(&ctx, tuples, store.config.bulk_chunk_size)?;
    let (mut stream, count) = merge::merged_stream(&ctx, output)?;
    let (root_offset, _) = build::build_dense_stream(&ctx, txn, &mut stream, count)?;

    let info = BTreeInfo {
        fanout,
        name: name.to_string(),
        key_serializer: key_ser.id().to_string(),
        value_serializer: val_ser.id().to_string(),
        allow_duplicates,
    };
    let (info_offset, _) = txn.write_record(&store.pager, &info.serialize())?;
    let header = TreeHeader {
        revision: txn.revision(),
        nb_elems: count as i64,
        root_offset,
        info_offset,
    };
    let (header_offset, _) = txn.write_record(&store.pager, &header.serialize())?;
    txn.add_tree_update(TreeUpdate {
        name: name.to_string(),
        kind: TreeKind::User,
        header_offset,
        nb_elems: count as i64,
        copied: Vec::new(),
        new_tree: true,
    });

    info!("bulk load of {:?}: {} key(s)", name, count);
    Ok((info, info_offset))
}
