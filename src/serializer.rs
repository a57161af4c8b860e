//! The serializer capability.
//!
//! A tree never looks inside its keys or values: everything it needs is
//! provided by a [`Serializer`] bound at open time. Serialized forms are
//! self-delimited so value sets can be concatenated into one blob and read
//! back sequentially.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::{
    error::SnapError,
    io::{SnapReader, SnapWriter},
    types::SnapResult,
};

pub trait Serializer<T>: Send + Sync {
    /// Stable identifier persisted in the tree metadata. Opening a tree
    /// with a serializer whose id differs from the stored one is refused.
    fn id(&self) -> &str;

    /// Self-delimited byte form of `item`.
    fn serialize(&self, item: &T) -> Vec<u8>;

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<T>;

    /// Total order used for key navigation and value-set ordering.
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

// ---------------------------------------------------------------- built-ins

pub struct I64Serializer;

impl Serializer<i64> for I64Serializer {
    fn id(&self) -> &str {
        "i64"
    }

    fn serialize(&self, item: &i64) -> Vec<u8> {
        item.to_be_bytes().to_vec()
    }

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<i64> {
        reader.get_i64()
    }

    fn compare(&self, a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }
}

pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn id(&self) -> &str {
        "u64"
    }

    fn serialize(&self, item: &u64) -> Vec<u8> {
        item.to_be_bytes().to_vec()
    }

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<u64> {
        Ok(reader.get_i64()? as u64)
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }
}

pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn id(&self) -> &str {
        "utf8"
    }

    fn serialize(&self, item: &String) -> Vec<u8> {
        let mut w = SnapWriter::with_capacity(4 + item.len());
        w.put_str(item);
        w.freeze().to_vec()
    }

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<String> {
        reader.get_str()
    }

    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }
}

pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn id(&self) -> &str {
        "bytes"
    }

    fn serialize(&self, item: &Vec<u8>) -> Vec<u8> {
        let mut w = SnapWriter::with_capacity(4 + item.len());
        w.put_bytes(item);
        w.freeze().to_vec()
    }

    fn deserialize(&self, reader: &mut SnapReader) -> SnapResult<Vec<u8>> {
        Ok(reader.get_bytes()?.to_vec())
    }

    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }
}

/// Zero-byte serializer for trees that only carry keys (nested value
/// trees store the values as keys and this as the value side).
pub struct UnitSerializer;

impl Serializer<()> for UnitSerializer {
    fn id(&self) -> &str {
        "unit"
    }

    fn serialize(&self, _item: &()) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize(&self, _reader: &mut SnapReader) -> SnapResult<()> {
        Ok(())
    }

    fn compare(&self, _a: &(), _b: &()) -> Ordering {
        Ordering::Equal
    }
}

// ------------------------------------------------------- raw key comparators

/// Compares serialized keys without deserializing them into their native
/// type. The inspector uses these to verify key ordering for trees whose
/// native types it does not know.
pub trait RawKeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> SnapResult<Ordering>;
}

struct RawI64;

impl RawKeyComparator for RawI64 {
    fn compare(&self, a: &[u8], b: &[u8]) -> SnapResult<Ordering> {
        let x = SnapReader::new(bytes::Bytes::copy_from_slice(a)).get_i64()?;
        let y = SnapReader::new(bytes::Bytes::copy_from_slice(b)).get_i64()?;
        Ok(x.cmp(&y))
    }
}

/// Works for "u64", "utf8" and "bytes": their serialized forms order
/// byte-wise exactly like the native values (length prefixes only ever
/// compare when one sequence is a prefix of the other, in which case the
/// shorter one sorts first either way).
struct RawLexicographic;

impl RawKeyComparator for RawLexicographic {
    fn compare(&self, a: &[u8], b: &[u8]) -> SnapResult<Ordering> {
        // Strip the i32 length prefix when present so prefix pairs order
        // by content, not by length header.
        let strip = |s: &[u8]| -> Vec<u8> {
            if s.len() >= 4 {
                s[4..].to_vec()
            } else {
                s.to_vec()
            }
        };
        Ok(strip(a).cmp(&strip(b)))
    }
}

struct RawU64;

impl RawKeyComparator for RawU64 {
    fn compare(&self, a: &[u8], b: &[u8]) -> SnapResult<Ordering> {
        Ok(a.cmp(b))
    }
}

/// `(name, revision)` composite used by the tree directory.
struct RawNameRevision;

impl RawKeyComparator for RawNameRevision {
    fn compare(&self, a: &[u8], b: &[u8]) -> SnapResult<Ordering> {
        let parse = |s: &[u8]| -> SnapResult<(String, i64)> {
            let mut r = SnapReader::new(bytes::Bytes::copy_from_slice(s));
            let name = r.get_str()?;
            let revision = r.get_i64()?;
            Ok((name, revision))
        };
        Ok(parse(a)?.cmp(&parse(b)?))
    }
}

/// `(revision, name)` composite used by the copied-pages tree.
struct RawRevisionName;

impl RawKeyComparator for RawRevisionName {
    fn compare(&self, a: &[u8], b: &[u8]) -> SnapResult<Ordering> {
        let parse = |s: &[u8]| -> SnapResult<(i64, String)> {
            let mut r = SnapReader::new(bytes::Bytes::copy_from_slice(s));
            let revision = r.get_i64()?;
            let name = r.get_str()?;
            Ok((revision, name))
        };
        Ok(parse(a)?.cmp(&parse(b)?))
    }
}

static RAW_COMPARATORS: Lazy<HashMap<&'static str, Arc<dyn RawKeyComparator>>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Arc<dyn RawKeyComparator>> = HashMap::new();
    m.insert("i64", Arc::new(RawI64));
    m.insert("u64", Arc::new(RawU64));
    m.insert("utf8", Arc::new(RawLexicographic));
    m.insert("bytes", Arc::new(RawLexicographic));
    m.insert("name-rev", Arc::new(RawNameRevision));
    m.insert("rev-name", Arc::new(RawRevisionName));
    m
});

/// Raw comparator for a serializer id, when the id is one of the
/// well-known ones. Unknown ids make the inspector skip ordering checks.
pub fn raw_comparator(id: &str) -> Option<Arc<dyn RawKeyComparator>> {
    RAW_COMPARATORS.get(id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_i64_round_trip() {
        let ser = I64Serializer;
        for v in [-1i64, 0, 42, i64::MAX, i64::MIN] {
            let bytes = ser.serialize(&v);
            let mut r = SnapReader::new(Bytes::from(bytes));
            assert_eq!(ser.deserialize(&mut r).unwrap(), v);
        }
    }

    #[test]
    fn test_string_round_trip() {
        let ser = StringSerializer;
        let v = "user:1234".to_string();
        let mut r = SnapReader::new(Bytes::from(ser.serialize(&v)));
        assert_eq!(ser.deserialize(&mut r).unwrap(), v);
    }

    #[test]
    fn test_raw_i64_orders_negatives() {
        let cmp = raw_comparator("i64").unwrap();
        let ser = I64Serializer;
        let a = ser.serialize(&-5);
        let b = ser.serialize(&3);
        assert_eq!(cmp.compare(&a, &b).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_raw_name_rev_orders_by_name_then_revision() {
        let cmp = raw_comparator("name-rev").unwrap();
        let enc = |name: &str, rev: i64| {
            let mut w = SnapWriter::new();
            w.put_str(name);
            w.put_i64(rev);
            w.freeze().to_vec()
        };
        assert_eq!(
            cmp.compare(&enc("a", 9), &enc("b", 1)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            cmp.compare(&enc("a", 1), &enc("a", 2)).unwrap(),
            Ordering::Less
        );
    }
}
