//! Phase 1: chunked sort.
//!
//! The input is consumed in chunks of `chunk_size` tuples. Each chunk is
//! sorted, grouped by key (values collected per key, sorted, exact
//! duplicates collapsed) and, when the input does not fit in one chunk,
//! spilled to an anonymous temp file as a sorted run:
//!
//! `{ keyLen, key, nbValues, { valueLen, value } * nbValues } * entries`
//!
//! An input that ends before a second chunk receives a tuple stays on
//! the all-in-memory path and never touches the disk.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};

use log::debug;

use crate::{
    btree::wal::TreeCtx,
    error::SnapError,
    types::SnapResult,
};

pub(crate) enum SortOutput<K, V> {
    InMemory(Vec<(K, Vec<V>)>),
    Runs(Vec<File>),
}

pub(crate) fn sort_into_runs<K, V>(
    ctx: &TreeCtx<'_, K, V>,
    mut tuples: impl Iterator<Item = (K, V)>,
    chunk_size: usize,
) -> SnapResult<SortOutput<K, V>> {
    let mut runs: Vec<File> = Vec::new();
    let mut carry: Option<(K, V)> = None;

    loop {
        let mut chunk: Vec<(K, V)> = Vec::new();
        if let Some(tuple) = carry.take() {
            chunk.push(tuple);
        }
        while chunk.len() < chunk_size {
            match tuples.next() {
                Some(tuple) => chunk.push(tuple),
                None => break,
            }
        }
        if chunk.is_empty() {
            if runs.is_empty() {
                return Ok(SortOutput::InMemory(Vec::new()));
            }
            break;
        }

        let full = chunk.len() == chunk_size;
        if full {
            // Probe for a second chunk; finding one forces the
            // external-sort path.
            carry = tuples.next();
        }
        let exhausted = !full || carry.is_none();

        let aggregated = aggregate(ctx, chunk)?;
        if runs.is_empty() && exhausted {
            debug!("bulk input fits in one chunk, staying in memory");
            return Ok(SortOutput::InMemory(aggregated));
        }

        runs.push(write_run(ctx, &aggregated)?);
        if exhausted {
            break;
        }
    }

    debug!("bulk input spilled into {} sorted run(s)", runs.len());
    Ok(SortOutput::Runs(runs))
}

/// Sort a chunk and group values per key. Exact duplicate pairs collapse
/// silently; distinct values under one key need duplicates enabled.
fn aggregate<K, V>(
    ctx: &TreeCtx<'_, K, V>,
    mut chunk: Vec<(K, V)>,
) -> SnapResult<Vec<(K, Vec<V>)>> {
    chunk.sort_by(|a, b| ctx.key_ser.compare(&a.0, &b.0));

    let mut out: Vec<(K, Vec<V>)> = Vec::new();
    for (key, value) in chunk {
        match out.last_mut() {
            Some((last_key, values))
                if ctx.key_ser.compare(last_key, &key) == Ordering::Equal =>
            {
                match values.binary_search_by(|probe| ctx.val_ser.compare(probe, &value)) {
                    Ok(_) => {} // same pair again
                    Err(pos) => {
                        if !ctx.allow_duplicates {
                            return Err(SnapError::DuplicateValueNotAllowed);
                        }
                        values.insert(pos, value);
                    }
                }
            }
            _ => out.push((key, vec![value])),
        }
    }
    Ok(out)
}

pub(crate) fn write_entry<K, V, W: Write>(
    ctx: &TreeCtx<'_, K, V>,
    w: &mut W,
    key: &K,
    values: &[V],
) -> SnapResult {
    let key_bytes = ctx.key_ser.serialize(key);
    w.write_all(&(key_bytes.len() as i32).to_be_bytes())?;
    w.write_all(&key_bytes)?;
    w.write_all(&(values.len() as i32).to_be_bytes())?;
    for value in values {
        let value_bytes = ctx.val_ser.serialize(value);
        w.write_all(&(value_bytes.len() as i32).to_be_bytes())?;
        w.write_all(&value_bytes)?;
    }
    Ok(())
}

fn write_run<K, V>(ctx: &TreeCtx<'_, K, V>, entries: &[(K, Vec<V>)]) -> SnapResult<File> {
    let file = tempfile::tempfile()?;
    let mut w = BufWriter::new(file);
    for (key, values) in entries {
        write_entry(ctx, &mut w, key, values)?;
    }
    let mut file = w.into_inner().map_err(|e| SnapError::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}
