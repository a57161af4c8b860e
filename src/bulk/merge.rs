//! Phase 2: k-way merge.
//!
//! One reader per sorted run; the smallest head key is emitted each
//! round. Runs are deduplicated internally, but the same key can still
//! appear in several runs, in which case the value sets are merged on
//! the fly. The merged output is written to one final run so the build
//! phase knows the exact key count before it streams.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};
use std::mem;

use bytes::Bytes;
use itertools::Itertools;
use log::debug;

use crate::{
    btree::wal::TreeCtx,
    error::SnapError,
    io::SnapReader,
    types::SnapResult,
};

use super::sort::{write_entry, SortOutput};

pub(crate) enum MergedStream<K, V> {
    Memory(std::vec::IntoIter<(K, Vec<V>)>),
    Run(RunReader),
}

impl<K, V> MergedStream<K, V> {
    pub fn next_group(&mut self, ctx: &TreeCtx<'_, K, V>) -> SnapResult<Option<(K, Vec<V>)>> {
        match self {
            MergedStream::Memory(iter) => Ok(iter.next()),
            MergedStream::Run(reader) => reader.next_entry(ctx),
        }
    }
}

/// Resolve the sort output into an in-order stream of unique keys plus
/// the exact number of keys.
pub(crate) fn merged_stream<K, V>(
    ctx: &TreeCtx<'_, K, V>,
    output: SortOutput<K, V>,
) -> SnapResult<(MergedStream<K, V>, usize)> {
    match output {
        SortOutput::InMemory(items) => {
            let count = items.len();
            Ok((MergedStream::Memory(items.into_iter()), count))
        }
        SortOutput::Runs(files) => {
            let mut readers: Vec<RunReader> = files.into_iter().map(RunReader::new).collect();
            let mut heads: Vec<Option<(K, Vec<V>)>> = Vec::with_capacity(readers.len());
            for reader in readers.iter_mut() {
                heads.push(reader.next_entry(ctx)?);
            }

            let out = tempfile::tempfile()?;
            let mut w = BufWriter::new(out);
            let mut count = 0usize;

            loop {
                let mut min_idx: Option<usize> = None;
                for i in 0..heads.len() {
                    if heads[i].is_none() {
                        continue;
                    }
                    min_idx = match min_idx {
                        None => Some(i),
                        Some(m) => {
                            let ki = &heads[i].as_ref().expect("checked above").0;
                            let km = &heads[m].as_ref().expect("candidate present").0;
                            if ctx.key_ser.compare(ki, km) == Ordering::Less {
                                Some(i)
                            } else {
                                Some(m)
                            }
                        }
                    };
                }
                let m = match min_idx {
                    None => break,
                    Some(m) => m,
                };

                let (key, mut values) = heads[m].take().expect("candidate present");
                heads[m] = readers[m].next_entry(ctx)?;

                // Absorb the same key from the other runs.
                for i in 0..heads.len() {
                    let same = matches!(
                        &heads[i],
                        Some((other, _)) if ctx.key_ser.compare(other, &key) == Ordering::Equal
                    );
                    if same {
                        let (_, other_values) = heads[i].take().expect("checked above");
                        merge_values(ctx, &mut values, other_values)?;
                        heads[i] = readers[i].next_entry(ctx)?;
                    }
                }

                write_entry(ctx, &mut w, &key, &values)?;
                count += 1;
            }

            let mut file = w.into_inner().map_err(|e| SnapError::Io(e.into_error()))?;
            file.seek(SeekFrom::Start(0))?;
            debug!("merged runs into {} unique key(s)", count);
            Ok((MergedStream::Run(RunReader::new(file)), count))
        }
    }
}

/// Merge two sorted value sets, collapsing exact duplicates.
fn merge_values<K, V>(
    ctx: &TreeCtx<'_, K, V>,
    into: &mut Vec<V>,
    from: Vec<V>,
) -> SnapResult {
    let own = mem::take(into);
    let mut deduped: Vec<V> = Vec::with_capacity(own.len() + from.len());
    for value in own
        .into_iter()
        .merge_by(from, |a, b| ctx.val_ser.compare(a, b) != Ordering::Greater)
    {
        let duplicate = matches!(
            deduped.last(),
            Some(last) if ctx.val_ser.compare(last, &value) == Ordering::Equal
        );
        if !duplicate {
            deduped.push(value);
        }
    }
    if !ctx.allow_duplicates && deduped.len() > 1 {
        return Err(SnapError::DuplicateValueNotAllowed);
    }
    *into = deduped;
    Ok(())
}

pub(crate) struct RunReader {
    reader: BufReader<File>,
}

impl RunReader {
    fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
        }
    }

    fn next_entry<K, V>(&mut self, ctx: &TreeCtx<'_, K, V>) -> SnapResult<Option<(K, Vec<V>)>> {
        let key_len = match read_opt_i32(&mut self.reader)? {
            None => return Ok(None),
            Some(len) => len,
        };
        let key_bytes = read_exact_vec(&mut self.reader, key_len)?;
        let key = ctx
            .key_ser
            .deserialize(&mut SnapReader::new(Bytes::from(key_bytes)))?;

        let nb_values = read_i32(&mut self.reader)?;
        let mut values = Vec::with_capacity(nb_values.max(0) as usize);
        for _ in 0..nb_values {
            let len = read_i32(&mut self.reader)?;
            let bytes = read_exact_vec(&mut self.reader, len)?;
            values.push(
                ctx.val_ser
                    .deserialize(&mut SnapReader::new(Bytes::from(bytes)))?,
            );
        }
        Ok(Some((key, values)))
    }
}

/// Read a length field, reporting a clean end-of-run as `None` and a
/// truncated one as an error.
fn read_opt_i32(r: &mut impl Read) -> SnapResult<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SnapError::EndOfFile("sorted run truncated".to_string()));
        }
        filled += n;
    }
    Ok(Some(i32::from_be_bytes(buf)))
}

fn read_i32(r: &mut impl Read) -> SnapResult<i32> {
    read_opt_i32(r)?.ok_or_else(|| SnapError::EndOfFile("sorted run truncated".to_string()))
}

fn read_exact_vec(r: &mut impl Read, len: i32) -> SnapResult<Vec<u8>> {
    if len < 0 {
        return Err(SnapError::InvalidBTree(format!(
            "negative length {} in sorted run",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}
