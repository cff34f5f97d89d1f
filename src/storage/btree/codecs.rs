//! Key comparators and key encoders for the tree kinds found in a container.

use std::cmp::Ordering;

use crate::types::{Oid, Xid};

/// Orders a search key relative to a candidate key read from a node.
///
/// `Ordering::Less` means the search key sorts before the candidate. Any state the
/// comparison needs (a case-folding flag, a volume handle) is captured by the
/// implementor; closures of the right shape implement the trait directly.
pub trait KeyCompare {
    /// Compares `search` against `candidate`.
    fn compare(&self, search: &[u8], candidate: &[u8]) -> Ordering;
}

impl<F> KeyCompare for F
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    fn compare(&self, search: &[u8], candidate: &[u8]) -> Ordering {
        self(search, candidate)
    }
}

/// Mask selecting the object id part of `obj_id_and_type`.
pub const OBJ_ID_MASK: u64 = 0x0fff_ffff_ffff_ffff;
/// Shift of the record type part of `obj_id_and_type`.
pub const OBJ_TYPE_SHIFT: u32 = 60;

fn le_u64(bytes: &[u8]) -> Option<u64> {
    let raw = bytes.get(..8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Some(u64::from_le_bytes(buf))
}

/// Compares filesystem-tree keys by object id, then record type.
///
/// Anything after the leading `obj_id_and_type` word (names, offsets) is ignored, so
/// this finds the first record of a given kind for an object. Keys shorter than
/// eight bytes fall back to a byte-wise comparison.
pub fn compare_std_key(search: &[u8], candidate: &[u8]) -> Ordering {
    match (le_u64(search), le_u64(candidate)) {
        (Some(s), Some(c)) => {
            let by_id = (s & OBJ_ID_MASK).cmp(&(c & OBJ_ID_MASK));
            by_id.then_with(|| (s >> OBJ_TYPE_SHIFT).cmp(&(c >> OBJ_TYPE_SHIFT)))
        }
        _ => search.cmp(candidate),
    }
}

/// Compares object-map keys (`omap_key_t`) by object id, then transaction id.
pub fn compare_omap_key(search: &[u8], candidate: &[u8]) -> Ordering {
    match (
        le_u64(search),
        le_u64(candidate),
        search.get(8..).and_then(le_u64),
        candidate.get(8..).and_then(le_u64),
    ) {
        (Some(s_oid), Some(c_oid), Some(s_xid), Some(c_xid)) => {
            s_oid.cmp(&c_oid).then_with(|| s_xid.cmp(&c_xid))
        }
        _ => search.cmp(candidate),
    }
}

/// Compares keys holding a single little-endian `u64`.
pub fn compare_u64_key(search: &[u8], candidate: &[u8]) -> Ordering {
    match (le_u64(search), le_u64(candidate)) {
        (Some(s), Some(c)) => s.cmp(&c),
        _ => search.cmp(candidate),
    }
}

/// Encodes an `obj_id_and_type` key header.
pub fn std_key(oid: Oid, record_type: u8) -> [u8; 8] {
    let raw = (oid.0 & OBJ_ID_MASK) | (u64::from(record_type & 0x0f) << OBJ_TYPE_SHIFT);
    raw.to_le_bytes()
}

/// Encodes an `omap_key_t`.
pub fn omap_key(oid: Oid, xid: Xid) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&oid.0.to_le_bytes());
    out[8..].copy_from_slice(&xid.0.to_le_bytes());
    out
}

/// Decodes an `omap_key_t`.
pub fn decode_omap_key(bytes: &[u8]) -> Option<(Oid, Xid)> {
    let oid = le_u64(bytes)?;
    let xid = le_u64(bytes.get(8..)?)?;
    Some((Oid(oid), Xid(xid)))
}

/// Encodes a single `u64` key.
pub fn u64_key(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}
